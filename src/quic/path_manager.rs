//! Tracks the current and fallback paths of a connection
//!
//! A newly opened path is used optimistically for sending right away, but the
//! last known-good path is kept until the new one validates. If validation
//! does not complete before the deadline the manager rolls back. The deadline
//! is checked lazily on every accessor, so callers must keep polling (each
//! packet sent or received is enough) or the rollback happens late.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::events::{EventSink, MigrationEvent};
use super::path_validator::PathValidator;
use super::types::Path;

/// Longest validation window `open_new_path` honors
pub const MAX_VALIDATION_TIMEOUT: Duration = Duration::from_secs(600);

pub struct PathManager {
    validator: Arc<Mutex<PathValidator>>,
    clock: Arc<dyn Clock>,
    current_path: Option<Path>,
    previous_path: Option<Path>,
    verify_deadline: Option<Instant>,
    events: EventSink,
}

impl PathManager {
    pub fn new(validator: Arc<Mutex<PathValidator>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            validator,
            clock,
            current_path: None,
            previous_path: None,
            verify_deadline: None,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Switch to `path` and start validating it. The path in use before the
    /// first pending switch is kept as the fallback.
    pub fn open_new_path(&mut self, path: Path, timeout: Duration) {
        self.reconcile();

        if self.verify_deadline.is_none() {
            self.previous_path = self.current_path;
        } else if let Some(superseded) = self.current_path.filter(|p| *p != path) {
            self.validator.lock().cancel(&superseded);
        }

        self.current_path = Some(path);
        self.validator.lock().validate(&path);
        let now = self.clock.now();
        let deadline = now
            .checked_add(timeout.min(MAX_VALIDATION_TIMEOUT))
            .unwrap_or(now);
        self.verify_deadline = Some(deadline);
        debug!("Opened new path {} (fallback: {:?})", path, self.previous_path);
    }

    /// Adopt `path` without validation, e.g. the path the handshake ran on
    pub fn set_trusted_path(&mut self, path: Path) {
        if self.verify_deadline.take().is_some() {
            if let Some(pending) = self.current_path.filter(|p| *p != path) {
                self.validator.lock().cancel(&pending);
            }
        }
        self.current_path = Some(path);
        self.previous_path = Some(path);
        debug!("Trusted path set to {}", path);
    }

    /// Path for regular traffic; may still be under validation
    pub fn get_current_path(&mut self) -> Option<Path> {
        self.reconcile();
        self.current_path
    }

    /// Last path known to be safe. Never returns a path whose validation is
    /// still pending.
    pub fn get_verified_path(&mut self) -> Option<Path> {
        self.reconcile();
        if self.verify_deadline.is_some() {
            self.previous_path
        } else {
            self.current_path
        }
    }

    pub fn is_validation_pending(&mut self) -> bool {
        self.reconcile();
        self.verify_deadline.is_some()
    }

    fn reconcile(&mut self) {
        let Some(deadline) = self.verify_deadline else {
            return;
        };
        let Some(current) = self.current_path else {
            self.verify_deadline = None;
            return;
        };

        if self.validator.lock().is_validated(&current) {
            if let Some(replaced) = self.previous_path.take().filter(|p| *p != current) {
                self.validator.lock().forget(&replaced);
            }
            self.verify_deadline = None;
            info!("Path {} committed", current);
            self.events.emit(MigrationEvent::PathCommitted(current));
        } else if self.clock.now() >= deadline {
            self.validator.lock().cancel(&current);
            let restored = self.previous_path.take();
            self.current_path = restored;
            self.verify_deadline = None;
            warn!("Path {} failed validation, rolled back to {:?}", current, restored);
            self.events.emit(MigrationEvent::PathRolledBack {
                failed: current,
                restored,
            });
        }
    }
}

impl fmt::Debug for PathManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathManager")
            .field("current_path", &self.current_path)
            .field("previous_path", &self.previous_path)
            .field("verify_deadline", &self.verify_deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::clock::ManualClock;
    use crate::quic::dispatcher::FrameHandler;
    use crate::quic::frame::Frame;
    use crate::quic::generator::FrameGenerator;
    use crate::quic::types::EncryptionLevel;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn path(port: u16) -> Path {
        Path::new("10.0.0.1:4433".parse().unwrap(), format!("198.51.100.2:{}", port).parse().unwrap())
    }

    fn setup() -> (PathManager, Arc<Mutex<PathValidator>>, ManualClock) {
        let validator = Arc::new(Mutex::new(PathValidator::new()));
        let clock = ManualClock::new();
        let manager = PathManager::new(Arc::clone(&validator), Arc::new(clock.clone()));
        (manager, validator, clock)
    }

    /// Answer the outstanding challenge on `p` as the peer would
    fn complete_validation(validator: &Arc<Mutex<PathValidator>>, p: &Path) {
        let mut validator = validator.lock();
        let out = validator.generate_frame(EncryptionLevel::OneRtt, p, 1200).unwrap();
        let Frame::PathChallenge { data } = out.frame else {
            panic!("expected challenge");
        };
        validator
            .handle_frame(EncryptionLevel::OneRtt, p, &Frame::PathResponse { data })
            .unwrap();
    }

    #[test]
    fn test_trusted_path_needs_no_validation() {
        let (mut manager, validator, _) = setup();
        let a = path(1);
        manager.set_trusted_path(a);

        assert_eq!(manager.get_current_path(), Some(a));
        assert_eq!(manager.get_verified_path(), Some(a));
        assert!(!manager.is_validation_pending());
        assert!(!validator.lock().is_validating(&a));
    }

    #[test]
    fn test_pending_path_is_current_but_not_verified() {
        let (mut manager, validator, _) = setup();
        let a = path(1);
        let b = path(2);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);

        assert!(validator.lock().is_validating(&b));
        assert_eq!(manager.get_current_path(), Some(b));
        assert_eq!(manager.get_verified_path(), Some(a));
    }

    #[test]
    fn test_validated_path_is_committed() {
        let (mut manager, validator, _) = setup();
        let (sink, mut rx) = EventSink::channel();
        manager = manager.with_events(sink);
        let a = path(1);
        let b = path(2);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);

        complete_validation(&validator, &b);

        assert_eq!(manager.get_verified_path(), Some(b));
        assert_eq!(manager.get_current_path(), Some(b));
        assert!(!manager.is_validation_pending());
        assert_eq!(rx.try_recv().unwrap(), MigrationEvent::PathCommitted(b));
    }

    #[test]
    fn test_commit_forgets_replaced_path() {
        let (mut manager, validator, _) = setup();
        let a = path(1);
        let b = path(2);
        let c = path(3);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);
        complete_validation(&validator, &b);
        assert!(!manager.is_validation_pending());

        manager.open_new_path(c, TIMEOUT);
        complete_validation(&validator, &c);
        assert_eq!(manager.get_verified_path(), Some(c));
        assert!(!validator.lock().is_validated(&b));
        assert!(validator.lock().is_validated(&c));
    }

    #[test]
    fn test_rollback_after_deadline() {
        let (mut manager, validator, clock) = setup();
        let (sink, mut rx) = EventSink::channel();
        manager = manager.with_events(sink);
        let a = path(1);
        let b = path(2);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);

        clock.advance(TIMEOUT - Duration::from_millis(1));
        assert_eq!(manager.get_current_path(), Some(b));

        clock.advance(Duration::from_millis(1));
        assert_eq!(manager.get_current_path(), Some(a));
        assert_eq!(manager.get_verified_path(), Some(a));
        assert!(!validator.lock().is_validating(&b));
        assert_eq!(
            rx.try_recv().unwrap(),
            MigrationEvent::PathRolledBack {
                failed: b,
                restored: Some(a)
            }
        );
    }

    #[test]
    fn test_oversized_timeout_is_clamped() {
        let (mut manager, _, clock) = setup();
        let a = path(1);
        let b = path(2);
        manager.set_trusted_path(a);
        manager.open_new_path(b, Duration::MAX);
        assert!(manager.is_validation_pending());

        clock.advance(MAX_VALIDATION_TIMEOUT);
        assert_eq!(manager.get_current_path(), Some(a));
    }

    #[test]
    fn test_late_response_after_rollback_does_not_commit() {
        let (mut manager, validator, clock) = setup();
        let a = path(1);
        let b = path(2);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);
        let data = {
            let mut v = validator.lock();
            match v.generate_frame(EncryptionLevel::OneRtt, &b, 1200).unwrap().frame {
                Frame::PathChallenge { data } => data,
                other => panic!("unexpected {:?}", other),
            }
        };

        clock.advance(TIMEOUT);
        assert_eq!(manager.get_current_path(), Some(a));

        validator
            .lock()
            .handle_frame(EncryptionLevel::OneRtt, &b, &Frame::PathResponse { data })
            .unwrap();
        assert!(!validator.lock().is_validated(&b));
        assert_eq!(manager.get_verified_path(), Some(a));
    }

    #[test]
    fn test_fallback_survives_superseding_path() {
        let (mut manager, validator, clock) = setup();
        let a = path(1);
        let b = path(2);
        let c = path(3);
        manager.set_trusted_path(a);
        manager.open_new_path(b, TIMEOUT);
        manager.open_new_path(c, TIMEOUT);

        // b's job was discarded, a is still the fallback
        assert!(!validator.lock().is_validating(&b));
        assert_eq!(manager.get_verified_path(), Some(a));

        clock.advance(TIMEOUT);
        assert_eq!(manager.get_current_path(), Some(a));
    }

    #[test]
    fn test_rollback_without_fallback_clears_current() {
        let (mut manager, _, clock) = setup();
        let a = path(1);
        manager.open_new_path(a, TIMEOUT);
        assert_eq!(manager.get_verified_path(), None);

        clock.advance(TIMEOUT);
        assert_eq!(manager.get_current_path(), None);
    }
}
