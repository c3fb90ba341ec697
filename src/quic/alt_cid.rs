//! Alternate connection ID management
//!
//! The local pool holds CIDs this endpoint issues to the peer through
//! NEW_CONNECTION_ID; each live local CID routes to this connection through
//! the shared `ConnectionTable`. The remote pool holds CIDs the peer issued to
//! us. Exactly one remote CID is in use as the destination of outgoing
//! packets; the rest are spares for migration. Reset tokens of remote CIDs are
//! registered in the shared `ResetTokenTable` so a stateless reset from the
//! peer can be recognized.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::MigrationConfig;

use super::dispatcher::FrameHandler;
use super::error::{ConnectionError, TransportErrorCode};
use super::frame::{Frame, FrameId, FrameType};
use super::generator::{FrameGenerator, OutgoingFrame};
use super::registry::{ConnectionHandle, ConnectionTable};
use super::reset_token::ResetTokenTable;
use super::types::{ConnectionId, EncryptionLevel, Path, ResetTokenKey, StatelessResetToken};

/// Capacity of the local pool, not counting the handshake CID
pub const MAX_LOCAL_ALT_CIDS: usize = 8;

/// Default `active_connection_id_limit` when the peer does not send one
pub const DEFAULT_ACTIVE_CID_LIMIT: u64 = 2;

const MAX_CID_GENERATION_ATTEMPTS: usize = 4;

const SEQUENCE_PREFERRED_ADDRESS: u64 = 1;

#[derive(Debug, Clone)]
pub struct AltCidSettings {
    pub scid_len: usize,
    pub num_alt_connection_ids: usize,
    /// Bound on the remote pool
    pub active_connection_id_limit: u64,
    /// Address advertised in the preferred_address transport parameter
    pub preferred_address: Option<SocketAddr>,
}

impl Default for AltCidSettings {
    fn default() -> Self {
        Self::from(&MigrationConfig::default())
    }
}

impl From<&MigrationConfig> for AltCidSettings {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            scid_len: config.scid_len,
            num_alt_connection_ids: config.num_alt_connection_ids.min(MAX_LOCAL_ALT_CIDS),
            active_connection_id_limit: config.active_connection_id_limit,
            preferred_address: config.preferred_address,
        }
    }
}

/// Contents of the preferred_address transport parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub address: SocketAddr,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

#[derive(Debug, Clone)]
struct LocalEntry {
    sequence_number: u64,
    cid: ConnectionId,
    token: StatelessResetToken,
    advertised: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteState {
    Unused,
    /// Selected by `migrate_to_alt_cid`, waiting for `migrate_to`
    Pending,
    Used,
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    sequence_number: u64,
    cid: ConnectionId,
    token: Option<StatelessResetToken>,
    state: RemoteState,
}

#[derive(Debug, Clone, Copy)]
enum SentFrame {
    NewConnectionId(u64),
    RetireConnectionId(u64),
}

pub struct AltConnectionIdManager {
    connection: ConnectionHandle,
    cid_table: Arc<ConnectionTable>,
    reset_tokens: Arc<ResetTokenTable>,
    key: ResetTokenKey,
    settings: AltCidSettings,

    local: Vec<LocalEntry>,
    next_local_sequence: u64,
    local_in_use: ConnectionId,
    peer_active_cid_limit: u64,

    remote: Vec<RemoteEntry>,
    remote_retire_prior_to: u64,
    remote_preferred_address: Option<SocketAddr>,

    retire_queue: VecDeque<u64>,
    /// Sequence numbers queued or in flight for RETIRE_CONNECTION_ID
    retire_pending: HashSet<u64>,
    in_flight: HashMap<FrameId, SentFrame>,
    closed: bool,
}

impl AltConnectionIdManager {
    /// `local_cid` is the CID the handshake ran with (sequence 0 of the local
    /// pool) and `remote_cid` the peer's handshake CID (sequence 0 of the
    /// remote pool, in use).
    pub fn new(
        connection: ConnectionHandle,
        cid_table: Arc<ConnectionTable>,
        reset_tokens: Arc<ResetTokenTable>,
        key: ResetTokenKey,
        settings: AltCidSettings,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
    ) -> Self {
        if !cid_table.insert(local_cid.clone(), connection) {
            trace!("Handshake CID {} already routed", local_cid);
        }

        let mut manager = Self {
            connection,
            cid_table,
            reset_tokens,
            local: vec![LocalEntry {
                sequence_number: 0,
                token: key.token_for(&local_cid),
                cid: local_cid.clone(),
                advertised: true,
            }],
            key,
            settings,
            next_local_sequence: 1,
            local_in_use: local_cid,
            peer_active_cid_limit: DEFAULT_ACTIVE_CID_LIMIT,
            remote: vec![RemoteEntry {
                sequence_number: 0,
                cid: remote_cid,
                token: None,
                state: RemoteState::Used,
            }],
            remote_retire_prior_to: 0,
            remote_preferred_address: None,
            retire_queue: VecDeque::new(),
            retire_pending: HashSet::new(),
            in_flight: HashMap::new(),
            closed: false,
        };

        if manager.settings.preferred_address.is_some() {
            manager.reserve_preferred_address_cid();
        }
        manager.replenish();
        manager
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// True if the peer has issued a CID we have not used yet
    pub fn is_ready_to_migrate(&self) -> bool {
        self.remote.iter().any(|e| e.state == RemoteState::Unused)
    }

    /// Pick the next unused remote CID for a migration. The switch completes
    /// when the caller passes the returned CID to `migrate_to`.
    pub fn migrate_to_alt_cid(&mut self) -> Option<ConnectionId> {
        let entry = self
            .remote
            .iter_mut()
            .filter(|e| e.state == RemoteState::Unused)
            .min_by_key(|e| e.sequence_number)?;
        entry.state = RemoteState::Pending;
        debug!("Selected remote CID {} (seq {}) for migration", entry.cid, entry.sequence_number);
        Some(entry.cid.clone())
    }

    /// Start sending to `cid`. Returns its stateless reset token, or `None`
    /// if `cid` is not an unused remote CID. The CID used before is retired.
    pub fn migrate_to(&mut self, cid: &ConnectionId) -> Option<StatelessResetToken> {
        let Some(idx) = self
            .remote
            .iter()
            .position(|e| e.cid == *cid && e.state != RemoteState::Used)
        else {
            warn!("Cannot migrate to unknown remote CID {}", cid);
            return None;
        };

        let token = self.remote[idx].token?;
        let sequence_number = self.remote[idx].sequence_number;

        if let Some(old) = self.remote.iter().position(|e| e.state == RemoteState::Used) {
            let retired = self.remote.remove(old);
            self.retire_remote_entry(retired);
        }
        for entry in self.remote.iter_mut() {
            if entry.cid == *cid {
                entry.state = RemoteState::Used;
            } else if entry.state == RemoteState::Pending {
                entry.state = RemoteState::Unused;
            }
        }

        info!("Migrated to remote CID {} (seq {})", cid, sequence_number);
        Some(token)
    }

    /// Stop using `cid`.
    ///
    /// A local CID is removed from the routing table and its sequence number
    /// queued for RETIRE_CONNECTION_ID. A spare remote CID is retired towards
    /// the peer. The CIDs currently in use cannot be dropped.
    pub fn drop_cid(&mut self, cid: &ConnectionId) -> bool {
        if let Some(idx) = self.local.iter().position(|e| e.cid == *cid) {
            if *cid == self.local_in_use {
                warn!("Refusing to drop local CID {} while in use", cid);
                return false;
            }
            let entry = self.local.remove(idx);
            self.cid_table.remove(&entry.cid, self.connection);
            self.queue_retirement(entry.sequence_number);
            debug!("Dropped local CID {} (seq {})", entry.cid, entry.sequence_number);
            return true;
        }

        if let Some(idx) = self
            .remote
            .iter()
            .position(|e| e.cid == *cid && e.state != RemoteState::Used)
        {
            let entry = self.remote.remove(idx);
            self.retire_remote_entry(entry);
            return true;
        }

        false
    }

    /// Record the peer's preferred_address transport parameter; its CID
    /// becomes remote sequence 1.
    pub fn set_remote_preferred_address(&mut self, preferred: PreferredAddress) -> Result<(), ConnectionError> {
        if preferred.connection_id.is_empty() {
            return Err(ConnectionError::new(
                TransportErrorCode::TransportParameterError,
                "preferred_address with zero-length connection ID",
            ));
        }
        if self
            .remote
            .iter()
            .any(|e| e.sequence_number == SEQUENCE_PREFERRED_ADDRESS)
        {
            return Err(ConnectionError::new(
                TransportErrorCode::TransportParameterError,
                "duplicate preferred_address",
            ));
        }

        self.register_token(preferred.stateless_reset_token);
        self.remote.push(RemoteEntry {
            sequence_number: SEQUENCE_PREFERRED_ADDRESS,
            cid: preferred.connection_id,
            token: Some(preferred.stateless_reset_token),
            state: RemoteState::Unused,
        });
        self.remote_preferred_address = Some(preferred.address);
        debug!("Peer prefers {}", preferred.address);
        Ok(())
    }

    pub fn remote_preferred_address(&self) -> Option<SocketAddr> {
        self.remote_preferred_address
    }

    /// Record the peer's active_connection_id_limit and top up the pool
    pub fn set_remote_active_cid_limit(&mut self, limit: u64) -> Result<(), ConnectionError> {
        if limit < DEFAULT_ACTIVE_CID_LIMIT {
            return Err(ConnectionError::new(
                TransportErrorCode::TransportParameterError,
                format!("active_connection_id_limit {} below {}", limit, DEFAULT_ACTIVE_CID_LIMIT),
            ));
        }
        self.peer_active_cid_limit = limit;
        self.replenish();
        Ok(())
    }

    /// Retire every local CID that is not in use and stop issuing new ones
    pub fn invalidate_alt_connections(&mut self) {
        self.closed = true;
        let in_use = self.local_in_use.clone();
        let (keep, retire): (Vec<_>, Vec<_>) = self.local.drain(..).partition(|e| e.cid == in_use);
        self.local = keep;

        for entry in retire {
            self.cid_table.remove(&entry.cid, self.connection);
            if entry.advertised {
                self.queue_retirement(entry.sequence_number);
            }
        }
        debug!("Invalidated alternate CIDs of {}", self.connection);
    }

    /// Local CID and token for the preferred_address transport parameter
    pub fn local_preferred_address(&self) -> Option<PreferredAddress> {
        let address = self.settings.preferred_address?;
        self.local
            .iter()
            .find(|e| e.sequence_number == SEQUENCE_PREFERRED_ADDRESS)
            .map(|e| PreferredAddress {
                address,
                connection_id: e.cid.clone(),
                stateless_reset_token: e.token,
            })
    }

    /// The peer started addressing us with `cid`
    pub fn set_local_cid_in_use(&mut self, cid: &ConnectionId) -> bool {
        if self.local.iter().any(|e| e.cid == *cid) {
            self.local_in_use = cid.clone();
            true
        } else {
            false
        }
    }

    pub fn local_cid_in_use(&self) -> &ConnectionId {
        &self.local_in_use
    }

    pub fn remote_cid_in_use(&self) -> Option<&ConnectionId> {
        self.remote
            .iter()
            .find(|e| e.state == RemoteState::Used)
            .map(|e| &e.cid)
    }

    /// Sequence number of the remote CID in use
    pub fn remote_sequence_in_use(&self) -> Option<u64> {
        self.remote
            .iter()
            .find(|e| e.state == RemoteState::Used)
            .map(|e| e.sequence_number)
    }

    pub fn local_cid_count(&self) -> usize {
        self.local.len()
    }

    pub fn remote_cid_count(&self) -> usize {
        self.remote.len()
    }

    /// Release every routing-table entry and reset token of this connection
    pub fn shutdown(&mut self) {
        self.closed = true;
        for entry in self.local.drain(..) {
            self.cid_table.remove(&entry.cid, self.connection);
        }
        self.remote.clear();
        let erased = self.reset_tokens.erase_connection(self.connection);
        self.retire_queue.clear();
        self.retire_pending.clear();
        self.in_flight.clear();
        trace!("Released CIDs of {} ({} reset tokens)", self.connection, erased);
    }

    fn reserve_preferred_address_cid(&mut self) {
        if let Some(mut entry) = self.new_local_entry() {
            entry.advertised = true;
            debug!("Reserved {} for preferred address", entry.cid);
            self.local.push(entry);
        }
    }

    fn local_pool_target(&self) -> usize {
        let alt = self.settings.num_alt_connection_ids.min(MAX_LOCAL_ALT_CIDS);
        let peer = usize::try_from(self.peer_active_cid_limit).unwrap_or(usize::MAX);
        (alt + 1).min(peer)
    }

    fn replenish(&mut self) {
        if self.closed {
            return;
        }
        while self.local.len() < self.local_pool_target() {
            match self.new_local_entry() {
                Some(entry) => self.local.push(entry),
                None => break,
            }
        }
    }

    fn new_local_entry(&mut self) -> Option<LocalEntry> {
        for _ in 0..MAX_CID_GENERATION_ATTEMPTS {
            let cid = match ConnectionId::generate_random(self.settings.scid_len) {
                Ok(cid) => cid,
                Err(e) => {
                    warn!("Cannot generate local CID: {}", e);
                    return None;
                }
            };
            if !self.cid_table.insert(cid.clone(), self.connection) {
                trace!("CID {} collided, retrying", cid);
                continue;
            }
            let sequence_number = self.next_local_sequence;
            self.next_local_sequence += 1;
            return Some(LocalEntry {
                sequence_number,
                token: self.key.token_for(&cid),
                cid,
                advertised: false,
            });
        }
        warn!("Giving up on local CID generation after {} collisions", MAX_CID_GENERATION_ATTEMPTS);
        None
    }

    fn queue_retirement(&mut self, sequence_number: u64) {
        if self.retire_pending.insert(sequence_number) {
            self.retire_queue.push_back(sequence_number);
        }
    }

    /// Unacknowledged retirements we accept before treating the peer as
    /// abusive: two remote pools' worth plus the whole local pool.
    fn retirement_capacity(&self) -> usize {
        let remote = self.settings.active_connection_id_limit.max(DEFAULT_ACTIVE_CID_LIMIT);
        usize::try_from(remote)
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .saturating_add(MAX_LOCAL_ALT_CIDS + 1)
    }

    fn check_retirement_capacity(&self, additional: usize) -> Result<(), ConnectionError> {
        let capacity = self.retirement_capacity();
        if self.retire_pending.len().saturating_add(additional) > capacity {
            return Err(ConnectionError::new(
                TransportErrorCode::ConnectionIdLimitError,
                format!("more than {} connection IDs awaiting retirement", capacity),
            )
            .with_frame_type(FrameType::NewConnectionId));
        }
        Ok(())
    }

    fn register_token(&self, token: StatelessResetToken) {
        if let Some(previous) = self.reset_tokens.insert(token, self.connection) {
            if previous != self.connection {
                warn!("Reset token {:?} moved from {} to {}", token, previous, self.connection);
            }
        }
    }

    fn retire_remote_entry(&mut self, entry: RemoteEntry) {
        if let Some(token) = entry.token {
            self.reset_tokens.erase_owned(&token, self.connection);
        }
        self.queue_retirement(entry.sequence_number);
        debug!("Retiring remote CID {} (seq {})", entry.cid, entry.sequence_number);
    }

    fn on_new_connection_id(
        &mut self,
        sequence_number: u64,
        retire_prior_to: u64,
        cid: &ConnectionId,
        token: StatelessResetToken,
    ) -> Result<(), ConnectionError> {
        let violation = |reason: String| ConnectionError::protocol_violation(FrameType::NewConnectionId, reason);

        if cid.is_empty() {
            return Err(violation("zero-length connection ID".to_string()));
        }
        if self.remote_cid_in_use().is_some_and(|c| c.is_empty()) {
            return Err(violation("peer uses zero-length connection IDs".to_string()));
        }
        if let Some(existing) = self.remote.iter().find(|e| e.sequence_number == sequence_number) {
            if existing.cid == *cid && existing.token == Some(token) {
                trace!("Duplicate NEW_CONNECTION_ID seq {}", sequence_number);
                return Ok(());
            }
            return Err(violation(format!("sequence number {} reused", sequence_number)));
        }
        if self.remote.iter().any(|e| e.cid == *cid) {
            return Err(violation(format!("CID {} issued twice", cid)));
        }

        if sequence_number < self.remote_retire_prior_to {
            debug!("NEW_CONNECTION_ID seq {} already retired", sequence_number);
            if !self.retire_pending.contains(&sequence_number) {
                self.check_retirement_capacity(1)?;
            }
            self.queue_retirement(sequence_number);
            return Ok(());
        }

        if retire_prior_to > self.remote_retire_prior_to {
            let retiring = self
                .remote
                .iter()
                .filter(|e| e.sequence_number < retire_prior_to && !self.retire_pending.contains(&e.sequence_number))
                .count();
            self.check_retirement_capacity(retiring)?;
            self.remote_retire_prior_to = retire_prior_to;
            let (retired, kept): (Vec<_>, Vec<_>) = self
                .remote
                .drain(..)
                .partition(|e| e.sequence_number < retire_prior_to);
            self.remote = kept;
            for entry in retired {
                self.retire_remote_entry(entry);
            }
        }

        let limit = usize::try_from(self.settings.active_connection_id_limit).unwrap_or(usize::MAX);
        if self.remote.len() >= limit {
            debug!(
                "Remote CID pool full ({}), ignoring seq {}",
                self.remote.len(),
                sequence_number
            );
        } else {
            self.register_token(token);
            self.remote.push(RemoteEntry {
                sequence_number,
                cid: cid.clone(),
                token: Some(token),
                state: RemoteState::Unused,
            });
            debug!("Peer issued CID {} (seq {})", cid, sequence_number);
        }

        if self.remote_cid_in_use().is_none() {
            let next = self
                .remote
                .iter_mut()
                .filter(|e| e.state != RemoteState::Used)
                .min_by_key(|e| e.sequence_number);
            match next {
                Some(entry) => {
                    entry.state = RemoteState::Used;
                    info!("Peer retired our destination CID, switched to seq {}", entry.sequence_number);
                }
                None => warn!("Peer retired every destination CID"),
            }
        }
        Ok(())
    }

    fn on_retire_connection_id(&mut self, sequence_number: u64) -> Result<(), ConnectionError> {
        if sequence_number >= self.next_local_sequence {
            return Err(ConnectionError::protocol_violation(
                FrameType::RetireConnectionId,
                format!("sequence number {} was never issued", sequence_number),
            ));
        }
        let Some(idx) = self.local.iter().position(|e| e.sequence_number == sequence_number) else {
            trace!("Local CID seq {} already retired", sequence_number);
            return Ok(());
        };
        if self.local[idx].cid == self.local_in_use {
            return Err(ConnectionError::protocol_violation(
                FrameType::RetireConnectionId,
                format!("peer retired CID {} while in use", self.local_in_use),
            ));
        }

        let entry = self.local.remove(idx);
        self.cid_table.remove(&entry.cid, self.connection);
        debug!("Peer retired local CID {} (seq {})", entry.cid, sequence_number);
        self.replenish();
        Ok(())
    }
}

impl FrameHandler for AltConnectionIdManager {
    fn interests(&self) -> &'static [FrameType] {
        &[FrameType::NewConnectionId, FrameType::RetireConnectionId]
    }

    fn handle_frame(&mut self, _level: EncryptionLevel, _path: &Path, frame: &Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => self.on_new_connection_id(
                *sequence_number,
                *retire_prior_to,
                connection_id,
                *stateless_reset_token,
            ),
            Frame::RetireConnectionId { sequence_number } => self.on_retire_connection_id(*sequence_number),
            other => Err(ConnectionError::internal("unexpected frame for CID manager").with_frame_type(other.frame_type())),
        }
    }
}

impl FrameGenerator for AltConnectionIdManager {
    fn will_generate_frame(&self, level: EncryptionLevel, _path: &Path) -> bool {
        level == EncryptionLevel::OneRtt
            && (!self.retire_queue.is_empty() || self.local.iter().any(|e| !e.advertised))
    }

    fn generate_frame(&mut self, level: EncryptionLevel, _path: &Path, max_frame_size: usize) -> Option<OutgoingFrame> {
        if level != EncryptionLevel::OneRtt {
            return None;
        }

        if let Some(&sequence_number) = self.retire_queue.front() {
            let frame = Frame::RetireConnectionId { sequence_number };
            if frame.encoded_len() > max_frame_size {
                return None;
            }
            self.retire_queue.pop_front();
            let out = OutgoingFrame::new(frame);
            self.in_flight.insert(out.id, SentFrame::RetireConnectionId(sequence_number));
            trace!("Sending RETIRE_CONNECTION_ID seq {}", sequence_number);
            return Some(out);
        }

        let entry = self.local.iter_mut().find(|e| !e.advertised)?;
        let frame = Frame::NewConnectionId {
            sequence_number: entry.sequence_number,
            retire_prior_to: 0,
            connection_id: entry.cid.clone(),
            stateless_reset_token: entry.token,
        };
        if frame.encoded_len() > max_frame_size {
            return None;
        }
        entry.advertised = true;
        let out = OutgoingFrame::new(frame);
        self.in_flight.insert(out.id, SentFrame::NewConnectionId(entry.sequence_number));
        trace!("Sending NEW_CONNECTION_ID seq {}", entry.sequence_number);
        Some(out)
    }

    fn on_frame_acked(&mut self, id: FrameId) {
        if let Some(SentFrame::RetireConnectionId(seq)) = self.in_flight.remove(&id) {
            self.retire_pending.remove(&seq);
        }
    }

    fn on_frame_lost(&mut self, id: FrameId) {
        match self.in_flight.remove(&id) {
            Some(SentFrame::NewConnectionId(seq)) => {
                if let Some(entry) = self.local.iter_mut().find(|e| e.sequence_number == seq) {
                    debug!("NEW_CONNECTION_ID seq {} lost, re-advertising", seq);
                    entry.advertised = false;
                }
            }
            Some(SentFrame::RetireConnectionId(seq)) => {
                debug!("RETIRE_CONNECTION_ID seq {} lost, re-queueing", seq);
                if !self.retire_queue.contains(&seq) {
                    self.retire_queue.push_back(seq);
                }
                self.retire_pending.insert(seq);
            }
            None => {}
        }
    }
}

impl Drop for AltConnectionIdManager {
    fn drop(&mut self) {
        if !self.local.is_empty() || !self.remote.is_empty() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for AltConnectionIdManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AltConnectionIdManager")
            .field("connection", &self.connection)
            .field("local", &self.local.len())
            .field("remote", &self.remote.len())
            .field("local_in_use", &self.local_in_use)
            .field("retire_queue", &self.retire_queue)
            .finish()
    }
}
