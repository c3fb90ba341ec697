//! Process-wide stateless reset token index (RFC 9000 Section 10.3)
//!
//! Maps tokens the peers handed us (in NEW_CONNECTION_ID frames or the
//! preferred address transport parameter) back to the connection they belong
//! to. When a datagram cannot be parsed as a packet for any known connection,
//! its trailing 16 bytes are looked up here; a hit means the peer lost its
//! state and the connection has to close immediately.

use dashmap::DashMap;
use tracing::{debug, info};

use super::registry::ConnectionHandle;
use super::types::{StatelessResetToken, STATELESS_RESET_TOKEN_LENGTH};

/// Smallest datagram that can carry a stateless reset: 5 bytes of
/// unpredictable header followed by the token.
pub const MIN_STATELESS_RESET_SIZE: usize = 5 + STATELESS_RESET_TOKEN_LENGTH;

#[derive(Debug, Default)]
pub struct ResetTokenTable {
    tokens: DashMap<StatelessResetToken, ConnectionHandle>,
}

impl ResetTokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `token` with `connection`, returning any previous owner
    pub fn insert(&self, token: StatelessResetToken, connection: ConnectionHandle) -> Option<ConnectionHandle> {
        debug!("Registering reset token {:?} for {}", token, connection);
        self.tokens.insert(token, connection)
    }

    pub fn lookup(&self, token: &StatelessResetToken) -> Option<ConnectionHandle> {
        self.tokens.get(token).map(|entry| *entry.value())
    }

    pub fn erase(&self, token: &StatelessResetToken) -> Option<ConnectionHandle> {
        self.tokens.remove(token).map(|(_, connection)| connection)
    }

    /// Remove `token` only if it still belongs to `connection`
    pub fn erase_owned(&self, token: &StatelessResetToken, connection: ConnectionHandle) -> bool {
        self.tokens
            .remove_if(token, |_, owner| *owner == connection)
            .is_some()
    }

    /// Drop every token that points at `connection`. Called on teardown so
    /// no lookup can hand out a handle to a dead connection.
    pub fn erase_connection(&self, connection: ConnectionHandle) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, owner| *owner != connection);
        before.saturating_sub(self.tokens.len())
    }

    /// Check whether an unparseable datagram is a stateless reset
    pub fn check_datagram(&self, datagram: &[u8]) -> Option<ConnectionHandle> {
        if datagram.len() < MIN_STATELESS_RESET_SIZE {
            return None;
        }
        let tail = &datagram[datagram.len() - STATELESS_RESET_TOKEN_LENGTH..];
        let token = StatelessResetToken::from_slice(tail)?;
        let connection = self.lookup(&token)?;
        info!("Stateless reset received for {}", connection);
        Some(connection)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
