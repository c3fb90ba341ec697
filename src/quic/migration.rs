//! Per-connection composition of the migration components
//!
//! `MigrationController` wires a connection's `PathValidator` and
//! `AltConnectionIdManager` into its `FrameDispatcher`, drives the
//! `PathManager`, and is the surface the packet layer talks to: inbound
//! payloads go to `receive`, the packet builder polls `poll_frame`, and loss
//! detection reports back through `on_frame_lost` / `on_frame_acked`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;

use super::alt_cid::{AltCidSettings, AltConnectionIdManager};
use super::clock::Clock;
use super::dispatcher::{FrameDispatcher, ReceiveOutcome, SharedFrameHandler, TrailingBytesPolicy};
use super::error::{ConnectionError, CryptoError};
use super::events::{EventSink, MigrationEvent};
use super::frame::{FrameFactory, FrameId, WireFrameFactory};
use super::generator::{FrameGenerator, OutgoingFrame};
use super::path_manager::PathManager;
use super::path_validator::PathValidator;
use super::registry::{ConnectionHandle, ConnectionTable};
use super::reset_token::ResetTokenTable;
use super::types::{ConnectionId, EncryptionLevel, Path, ResetTokenKey};

/// Process-wide state shared by every connection of an endpoint
#[derive(Debug, Clone)]
pub struct SharedTables {
    pub cid_table: Arc<ConnectionTable>,
    pub reset_tokens: Arc<ResetTokenTable>,
    pub reset_key: ResetTokenKey,
}

impl SharedTables {
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self::with_key(ResetTokenKey::generate()?))
    }

    pub fn with_key(reset_key: ResetTokenKey) -> Self {
        Self {
            cid_table: Arc::new(ConnectionTable::new()),
            reset_tokens: Arc::new(ResetTokenTable::new()),
            reset_key,
        }
    }
}

pub struct MigrationController {
    connection: ConnectionHandle,
    dispatcher: FrameDispatcher,
    validator: Arc<Mutex<PathValidator>>,
    cid_manager: Arc<Mutex<AltConnectionIdManager>>,
    path_manager: PathManager,
    validation_timeout: Duration,
    events: EventSink,
}

impl MigrationController {
    /// `local_cid` / `remote_cid` are the connection IDs the handshake used
    pub fn new(
        connection: ConnectionHandle,
        config: &MigrationConfig,
        tables: &SharedTables,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        Self::with_factory(
            connection,
            config,
            tables,
            local_cid,
            remote_cid,
            clock,
            events,
            Box::new(WireFrameFactory),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_factory(
        connection: ConnectionHandle,
        config: &MigrationConfig,
        tables: &SharedTables,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        clock: Arc<dyn Clock>,
        events: EventSink,
        factory: Box<dyn FrameFactory>,
    ) -> Self {
        let validated = events.clone();
        let validator = Arc::new(Mutex::new(PathValidator::with_callback(Box::new(
            move |path: &Path, ok: bool| {
                if ok {
                    validated.emit(MigrationEvent::PathValidated(*path));
                }
            },
        ))));

        let cid_manager = Arc::new(Mutex::new(AltConnectionIdManager::new(
            connection,
            Arc::clone(&tables.cid_table),
            Arc::clone(&tables.reset_tokens),
            tables.reset_key.clone(),
            AltCidSettings::from(config),
            local_cid,
            remote_cid,
        )));

        let policy = if config.reject_trailing_garbage {
            TrailingBytesPolicy::Reject
        } else {
            TrailingBytesPolicy::Truncate
        };
        let mut dispatcher = FrameDispatcher::new(factory).with_policy(policy);
        let validator_handler: SharedFrameHandler = validator.clone();
        let cid_handler: SharedFrameHandler = cid_manager.clone();
        dispatcher.add_handler(validator_handler);
        dispatcher.add_handler(cid_handler);

        let path_manager = PathManager::new(Arc::clone(&validator), clock).with_events(events.clone());

        Self {
            connection,
            dispatcher,
            validator,
            cid_manager,
            path_manager,
            validation_timeout: Duration::from_millis(config.path_validation_timeout_ms),
            events,
        }
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Adopt the handshake path without validation
    pub fn set_trusted_path(&mut self, path: Path) {
        self.path_manager.set_trusted_path(path);
    }

    /// Dispatch the payload of a packet that arrived on `path`
    pub fn receive(
        &mut self,
        level: EncryptionLevel,
        path: &Path,
        payload: &[u8],
    ) -> Result<ReceiveOutcome, ConnectionError> {
        let outcome = self.dispatcher.receive_frames(level, path, payload)?;
        // A response may have validated the pending path
        self.path_manager.is_validation_pending();
        Ok(outcome)
    }

    /// Next migration frame for a packet at `level` on `path`, if any.
    /// PATH_CHALLENGE/PATH_RESPONSE take priority over CID frames.
    pub fn poll_frame(&mut self, level: EncryptionLevel, path: &Path, max_frame_size: usize) -> Option<OutgoingFrame> {
        self.path_manager.is_validation_pending();

        {
            let mut validator = self.validator.lock();
            if validator.will_generate_frame(level, path) {
                if let Some(frame) = validator.generate_frame(level, path, max_frame_size) {
                    return Some(frame);
                }
            }
        }

        let mut cid_manager = self.cid_manager.lock();
        if cid_manager.will_generate_frame(level, path) {
            return cid_manager.generate_frame(level, path, max_frame_size);
        }
        None
    }

    pub fn on_frame_lost(&mut self, id: FrameId) {
        self.validator.lock().on_frame_lost(id);
        self.cid_manager.lock().on_frame_lost(id);
    }

    pub fn on_frame_acked(&mut self, id: FrameId) {
        self.validator.lock().on_frame_acked(id);
        self.cid_manager.lock().on_frame_acked(id);
    }

    /// Move the connection to `path` under a fresh destination CID.
    ///
    /// Returns the new destination CID, or `None` if the peer has not issued
    /// a spare one; in that case nothing changes.
    pub fn migrate(&mut self, path: Path) -> Option<ConnectionId> {
        let cid = {
            let mut cid_manager = self.cid_manager.lock();
            let Some(cid) = cid_manager.migrate_to_alt_cid() else {
                warn!("No spare connection ID, not migrating to {}", path);
                return None;
            };
            cid_manager.migrate_to(&cid)?;
            let sequence_number = cid_manager.remote_sequence_in_use().unwrap_or_default();
            self.events.emit(MigrationEvent::CidMigrated {
                sequence_number,
                cid: cid.clone(),
            });
            cid
        };

        info!("Migrating {} to {} with CID {}", self.connection, path, cid);
        self.path_manager.open_new_path(path, self.validation_timeout);
        Some(cid)
    }

    /// Start validating `path` without changing CIDs, e.g. after the peer's
    /// address changed
    pub fn probe_path(&mut self, path: Path) {
        debug!("Probing {} for {}", path, self.connection);
        self.path_manager.open_new_path(path, self.validation_timeout);
    }

    pub fn current_path(&mut self) -> Option<Path> {
        self.path_manager.get_current_path()
    }

    pub fn verified_path(&mut self) -> Option<Path> {
        self.path_manager.get_verified_path()
    }

    pub fn is_validation_pending(&mut self) -> bool {
        self.path_manager.is_validation_pending()
    }

    pub fn destination_cid(&self) -> Option<ConnectionId> {
        self.cid_manager.lock().remote_cid_in_use().cloned()
    }

    pub fn cid_manager(&self) -> &Arc<Mutex<AltConnectionIdManager>> {
        &self.cid_manager
    }

    pub fn validator(&self) -> &Arc<Mutex<PathValidator>> {
        &self.validator
    }

    /// Release every shared-table entry of this connection. Must run before
    /// the connection leaves its registry.
    pub fn teardown(&mut self) {
        let mut cid_manager = self.cid_manager.lock();
        cid_manager.invalidate_alt_connections();
        cid_manager.shutdown();
        info!("Tore down migration state of {}", self.connection);
    }
}

impl fmt::Debug for MigrationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationController")
            .field("connection", &self.connection)
            .field("dispatcher", &self.dispatcher)
            .field("path_manager", &self.path_manager)
            .field("validation_timeout", &self.validation_timeout)
            .finish()
    }
}
