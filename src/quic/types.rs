//! Identifiers shared by the migration subsystem
//!
//! - Connection IDs (RFC 9000 Section 5.1)
//! - Stateless reset tokens and the secret they are derived from
//! - Network paths and encryption levels

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use rand::RngCore;
use ring::hmac;

use super::error::{CryptoError, ProtocolError};

/// Maximum length of a connection ID (RFC 9000)
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Default length of locally issued connection IDs
pub const DEFAULT_CONNECTION_ID_LENGTH: usize = 8;

/// Stateless reset token length (128 bits)
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

/// Opaque connection identifier, 0 to 20 bytes
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    /// Create from raw bytes
    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(ProtocolError::InvalidConnectionIdLength(data.len()));
        }
        Ok(Self(Bytes::copy_from_slice(data)))
    }

    /// Generate a random connection ID
    pub fn generate_random(length: usize) -> Result<Self, ProtocolError> {
        if length > MAX_CONNECTION_ID_LENGTH {
            return Err(ProtocolError::InvalidConnectionIdLength(length));
        }

        let mut data = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut data);
        Ok(Self(Bytes::from(data)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Stateless reset token for a connection ID
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatelessResetToken([u8; STATELESS_RESET_TOKEN_LENGTH]);

impl StatelessResetToken {
    pub fn new(data: [u8; STATELESS_RESET_TOKEN_LENGTH]) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; STATELESS_RESET_TOKEN_LENGTH] = data.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; STATELESS_RESET_TOKEN_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for StatelessResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatelessResetToken({})", hex::encode(self.0))
    }
}

/// Secret used to derive stateless reset tokens for locally issued CIDs.
///
/// A token is `HMAC-SHA256(secret, cid)[..16]`, so an observer who sees the
/// CID on the wire cannot forge the token.
#[derive(Clone)]
pub struct ResetTokenKey {
    key: hmac::Key,
}

impl ResetTokenKey {
    /// Generate a fresh random secret
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = ring::rand::SystemRandom::new();
        let key = hmac::Key::generate(hmac::HMAC_SHA256, &rng)?;
        Ok(Self { key })
    }

    /// Build from an existing secret (shared between processes of a cluster)
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    pub fn token_for(&self, cid: &ConnectionId) -> StatelessResetToken {
        let tag = hmac::sign(&self.key, cid.as_bytes());
        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&tag.as_ref()[..STATELESS_RESET_TOKEN_LENGTH]);
        StatelessResetToken(token)
    }
}

impl fmt::Debug for ResetTokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResetTokenKey(..)")
    }
}

/// A (local, remote) socket address pair over which packets travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Path {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Packet protection level a frame was carried at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_creation() {
        let id = ConnectionId::generate_random(8).unwrap();
        assert_eq!(id.len(), 8);

        let empty = ConnectionId::generate_random(0).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_connection_id_length_limit() {
        assert!(ConnectionId::generate_random(21).is_err());
        assert!(ConnectionId::from_slice(&[0u8; 21]).is_err());
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_connection_id_display_is_hex() {
        let id = ConnectionId::from_slice(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(id.to_string(), "deadbeef");
    }

    #[test]
    fn test_reset_token_derivation() {
        let key = ResetTokenKey::from_secret(b"test_secret_key_for_reset_tokens");
        let id = ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let other = ConnectionId::from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]).unwrap();

        // Deriving again should give the same result
        assert_eq!(key.token_for(&id), key.token_for(&id));
        assert_ne!(key.token_for(&id), key.token_for(&other));

        let fresh = ResetTokenKey::generate().unwrap();
        assert_ne!(fresh.token_for(&id), key.token_for(&id));
    }

    #[test]
    fn test_path_equality_uses_both_addresses() {
        let a = Path::new("10.0.0.1:4433".parse().unwrap(), "192.0.2.1:5000".parse().unwrap());
        let b = Path::new("10.0.0.2:4433".parse().unwrap(), "192.0.2.1:5000".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a, Path::new(a.local, a.remote));
    }
}
