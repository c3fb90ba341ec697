//! Events reported to the owning connection

use tokio::sync::mpsc;
use tracing::trace;

use super::types::{ConnectionId, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    /// A PATH_RESPONSE matched an outstanding challenge
    PathValidated(Path),
    /// The path being validated became the committed current path
    PathCommitted(Path),
    /// Validation did not finish before the deadline
    PathRolledBack { failed: Path, restored: Option<Path> },
    /// Outgoing packets now carry a different destination connection ID
    CidMigrated { sequence_number: u64, cid: ConnectionId },
}

/// Optional event channel. Sending never blocks; a closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<MigrationEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<MigrationEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a sink together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: MigrationEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Migration event receiver dropped");
            }
        }
    }
}
