//! Stateless retry cookies
//!
//! A cookie is `HMAC-SHA1(secret, client address)`. The server hands it out
//! in a Retry and accepts the client's echo without keeping per-client state.
//! The secret rotates periodically; cookies minted under the previous secret
//! still verify.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use ring::hmac;
use ring::rand::SystemRandom;
use tracing::{debug, info, trace};

use crate::config::RetryConfig;

use super::clock::Clock;
use super::error::CryptoError;

/// Length of a cookie in bytes
pub const COOKIE_LEN: usize = 20;

struct Secrets {
    current: hmac::Key,
    previous: Option<hmac::Key>,
    rotated_at: Instant,
    generation: u64,
}

/// Process-wide retry cookie minter, shared between connections via `Arc`
pub struct StatelessRetry {
    enabled: bool,
    secrets: RwLock<Secrets>,
    rng: SystemRandom,
    rotation: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl StatelessRetry {
    /// Generate a random secret
    pub fn new(config: &RetryConfig, clock: Arc<dyn Clock>) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let current = hmac::Key::generate(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &rng)?;
        Ok(Self::from_key(current, rng, config, clock))
    }

    /// Use a fixed initial secret, e.g. one shared by every server of a cluster
    pub fn with_secret(secret: &[u8], config: &RetryConfig, clock: Arc<dyn Clock>) -> Self {
        let current = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
        Self::from_key(current, SystemRandom::new(), config, clock)
    }

    fn from_key(current: hmac::Key, rng: SystemRandom, config: &RetryConfig, clock: Arc<dyn Clock>) -> Self {
        let rotated_at = clock.now();
        Self {
            enabled: config.enabled,
            secrets: RwLock::new(Secrets {
                current,
                previous: None,
                rotated_at,
                generation: 0,
            }),
            rng,
            rotation: config.rotation_interval(),
            clock,
        }
    }

    pub fn generate_cookie(&self, client: &SocketAddr) -> Result<[u8; COOKIE_LEN], CryptoError> {
        self.maybe_rotate()?;
        let secrets = self.secrets.read();
        let tag = hmac::sign(&secrets.current, identity(client).as_bytes());
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(tag.as_ref());
        trace!("Minted retry cookie for {}", client);
        Ok(cookie)
    }

    /// Constant-time check of `cookie` against the current and previous secret
    pub fn verify_cookie(&self, client: &SocketAddr, cookie: &[u8]) -> bool {
        if let Err(e) = self.maybe_rotate() {
            debug!("Retry secret rotation failed: {}", e);
        }
        let secrets = self.secrets.read();
        let data = identity(client);
        if hmac::verify(&secrets.current, data.as_bytes(), cookie).is_ok() {
            return true;
        }
        let valid = secrets
            .previous
            .as_ref()
            .is_some_and(|key| hmac::verify(key, data.as_bytes(), cookie).is_ok());
        if !valid {
            debug!("Rejected retry cookie from {}", client);
        }
        valid
    }

    /// Whether a client presenting `token` (if any) must first go through a
    /// Retry round-trip. Always `false` when retry is disabled.
    pub fn requires_retry(&self, client: &SocketAddr, token: Option<&[u8]>) -> bool {
        if !self.enabled {
            return false;
        }
        !token.is_some_and(|cookie| self.verify_cookie(client, cookie))
    }

    /// Write the cookie for `client` into `buf`, returning its length
    pub fn write_cookie(&self, client: &SocketAddr, buf: &mut [u8]) -> Result<usize, CryptoError> {
        if buf.len() < COOKIE_LEN {
            return Err(CryptoError::BufferTooSmall {
                needed: COOKIE_LEN,
                available: buf.len(),
            });
        }
        let cookie = self.generate_cookie(client)?;
        buf[..COOKIE_LEN].copy_from_slice(&cookie);
        Ok(COOKIE_LEN)
    }

    /// Replace the secret; the old one is kept for verification only
    pub fn rotate_secret(&self) -> Result<(), CryptoError> {
        let next = hmac::Key::generate(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &self.rng)?;
        let now = self.clock.now();
        Self::install(&mut self.secrets.write(), next, now);
        Ok(())
    }

    /// Rotate if the configured interval has passed. Returns whether it did.
    pub fn maybe_rotate(&self) -> Result<bool, CryptoError> {
        let Some(interval) = self.rotation else {
            return Ok(false);
        };
        let now = self.clock.now();
        if !rotation_due(self.secrets.read().rotated_at, interval, now) {
            return Ok(false);
        }

        let next = hmac::Key::generate(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &self.rng)?;
        let mut secrets = self.secrets.write();
        // another caller may have rotated while we waited for the lock
        if !rotation_due(secrets.rotated_at, interval, now) {
            return Ok(false);
        }
        Self::install(&mut secrets, next, now);
        Ok(true)
    }

    fn install(secrets: &mut Secrets, next: hmac::Key, now: Instant) {
        let old = std::mem::replace(&mut secrets.current, next);
        secrets.previous = Some(old);
        secrets.rotated_at = now;
        secrets.generation += 1;
        info!("Rotated retry secret (generation {})", secrets.generation);
    }

    /// Number of rotations so far
    pub fn generation(&self) -> u64 {
        self.secrets.read().generation
    }

    /// Handshake-library adapter: writes the cookie into `buf` and its length
    /// into `len`. Returns 1 on success, 0 on failure.
    pub fn generate_cookie_cb(&self, client: &SocketAddr, buf: &mut [u8], len: &mut usize) -> i32 {
        match self.write_cookie(client, buf) {
            Ok(written) => {
                *len = written;
                1
            }
            Err(e) => {
                debug!("Cookie generation failed: {}", e);
                0
            }
        }
    }

    /// Handshake-library adapter: 1 if `cookie` is valid for `client`, else 0
    pub fn verify_cookie_cb(&self, client: &SocketAddr, cookie: &[u8]) -> i32 {
        i32::from(self.verify_cookie(client, cookie))
    }
}

impl fmt::Debug for StatelessRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessRetry")
            .field("enabled", &self.enabled)
            .field("generation", &self.generation())
            .field("rotation", &self.rotation)
            .finish()
    }
}

/// An interval too long to represent as an `Instant` never elapses
fn rotation_due(rotated_at: Instant, interval: Duration, now: Instant) -> bool {
    rotated_at.checked_add(interval).is_some_and(|due| due <= now)
}

fn identity(client: &SocketAddr) -> String {
    client.to_string()
}
