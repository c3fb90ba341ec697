//! Path validation (RFC 9000 Section 8.2)
//!
//! Proves that a peer can receive packets at a claimed address by sending an
//! unpredictable PATH_CHALLENGE and waiting for the matching PATH_RESPONSE on
//! the same path. This component never fails a validation on its own: a job
//! that never completes is simply discarded when the `PathManager`'s
//! deadline passes.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use rand::RngCore;
use tracing::{debug, info, trace};

use super::dispatcher::FrameHandler;
use super::error::ConnectionError;
use super::frame::{Frame, FrameId, FrameType, PATH_CHALLENGE_DATA_LEN};
use super::generator::{FrameGenerator, OutgoingFrame};
use super::types::{EncryptionLevel, Path};

/// Challenges kept per job; a reissued fourth challenge evicts the oldest
pub const MAX_OUTSTANDING_CHALLENGES: usize = 3;

/// Paths we will queue PATH_RESPONSE echoes for at once
const MAX_PENDING_RESPONSES: usize = 16;

/// Validated paths remembered at once; the oldest is forgotten first
const MAX_VALIDATED_PATHS: usize = 4;

const PATH_FRAME_SIZE: usize = 1 + PATH_CHALLENGE_DATA_LEN;

pub type ChallengeData = [u8; PATH_CHALLENGE_DATA_LEN];

/// Invoked with the path and `true` once a path has been validated
pub type ValidationCallback = Box<dyn FnMut(&Path, bool) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    NotValidated,
    Validating,
    Validated,
}

#[derive(Debug)]
struct ValidationJob {
    state: ValidationState,
    /// Challenges a response may echo, oldest first
    outstanding: VecDeque<ChallengeData>,
    /// Newest `unsent` entries of `outstanding` still await transmission
    unsent: usize,
}

impl ValidationJob {
    fn start() -> Self {
        let mut job = Self {
            state: ValidationState::Validating,
            outstanding: VecDeque::with_capacity(MAX_OUTSTANDING_CHALLENGES),
            unsent: 0,
        };
        job.issue_challenge();
        job
    }

    fn issue_challenge(&mut self) {
        let mut data = [0u8; PATH_CHALLENGE_DATA_LEN];
        rand::thread_rng().fill_bytes(&mut data);

        if self.outstanding.len() == MAX_OUTSTANDING_CHALLENGES {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(data);
        self.unsent = (self.unsent + 1).min(self.outstanding.len());
    }

    fn next_unsent(&mut self) -> Option<ChallengeData> {
        if self.unsent == 0 {
            return None;
        }
        let data = self.outstanding[self.outstanding.len() - self.unsent];
        self.unsent -= 1;
        Some(data)
    }

    fn matches(&self, data: &ChallengeData) -> bool {
        self.outstanding.iter().any(|c| c == data)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingResponse {
    path: Path,
    data: ChallengeData,
}

pub struct PathValidator {
    jobs: HashMap<Path, ValidationJob>,
    validated: VecDeque<Path>,
    responses: Vec<PendingResponse>,
    /// Challenges in flight, for loss feedback
    sent_challenges: HashMap<FrameId, Path>,
    on_validated: Option<ValidationCallback>,
}

impl PathValidator {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            validated: VecDeque::with_capacity(MAX_VALIDATED_PATHS),
            responses: Vec::new(),
            sent_challenges: HashMap::new(),
            on_validated: None,
        }
    }

    pub fn with_callback(callback: ValidationCallback) -> Self {
        let mut validator = Self::new();
        validator.on_validated = Some(callback);
        validator
    }

    pub fn set_callback(&mut self, callback: ValidationCallback) {
        self.on_validated = Some(callback);
    }

    /// Start validating `path`. Idempotent while a validation is running; a
    /// previously validated path is validated again.
    pub fn validate(&mut self, path: &Path) {
        if self.jobs.contains_key(path) {
            trace!("Validation already in progress for {}", path);
            return;
        }
        self.forget(path);
        self.jobs.insert(*path, ValidationJob::start());
        debug!("Started path validation for {}", path);
    }

    pub fn state(&self, path: &Path) -> ValidationState {
        if let Some(job) = self.jobs.get(path) {
            return job.state;
        }
        if self.validated.contains(path) {
            ValidationState::Validated
        } else {
            ValidationState::NotValidated
        }
    }

    pub fn is_validating(&self, path: &Path) -> bool {
        self.state(path) == ValidationState::Validating
    }

    pub fn is_validated(&self, path: &Path) -> bool {
        self.state(path) == ValidationState::Validated
    }

    /// Discard the job for `path`, if any
    pub fn cancel(&mut self, path: &Path) {
        if self.jobs.remove(path).is_some() {
            self.sent_challenges.retain(|_, p| p != path);
            debug!("Abandoned path validation for {}", path);
        }
    }

    /// Forget that `path` was validated
    pub fn forget(&mut self, path: &Path) {
        self.validated.retain(|p| p != path);
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    fn on_challenge(&mut self, path: &Path, data: ChallengeData) {
        if let Some(existing) = self.responses.iter_mut().find(|r| r.path == *path) {
            // Only the latest challenge per path is answered
            existing.data = data;
            return;
        }
        if self.responses.len() < MAX_PENDING_RESPONSES {
            self.responses.push(PendingResponse { path: *path, data });
        } else {
            trace!("Ignoring excessive PATH_CHALLENGE from {}", path);
        }
    }

    fn on_response(&mut self, path: &Path, data: ChallengeData) {
        let matched = self
            .jobs
            .get(path)
            .map(|job| job.state == ValidationState::Validating && job.matches(&data))
            .unwrap_or(false);

        if !matched {
            debug!("Ignoring unmatched PATH_RESPONSE on {}", path);
            return;
        }

        self.jobs.remove(path);
        self.sent_challenges.retain(|_, p| p != path);
        if self.validated.len() == MAX_VALIDATED_PATHS {
            self.validated.pop_front();
        }
        self.validated.push_back(*path);
        info!("Path validated: {}", path);

        if let Some(callback) = self.on_validated.as_mut() {
            callback(path, true);
        }
    }
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PathValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathValidator")
            .field("jobs", &self.jobs)
            .field("validated", &self.validated)
            .field("pending_responses", &self.responses.len())
            .finish()
    }
}

impl FrameHandler for PathValidator {
    fn interests(&self) -> &'static [FrameType] {
        &[FrameType::PathChallenge, FrameType::PathResponse]
    }

    fn handle_frame(&mut self, _level: EncryptionLevel, path: &Path, frame: &Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::PathChallenge { data } => {
                self.on_challenge(path, *data);
                Ok(())
            }
            Frame::PathResponse { data } => {
                self.on_response(path, *data);
                Ok(())
            }
            other => Err(ConnectionError::internal(format!(
                "path validator received {:?}",
                other.frame_type()
            ))
            .with_frame_type(other.frame_type())),
        }
    }
}

impl FrameGenerator for PathValidator {
    fn will_generate_frame(&self, level: EncryptionLevel, path: &Path) -> bool {
        if level != EncryptionLevel::OneRtt {
            return false;
        }
        self.responses.iter().any(|r| r.path == *path)
            || self.jobs.get(path).map(|job| job.unsent > 0).unwrap_or(false)
    }

    fn generate_frame(&mut self, level: EncryptionLevel, path: &Path, max_frame_size: usize) -> Option<OutgoingFrame> {
        if level != EncryptionLevel::OneRtt || max_frame_size < PATH_FRAME_SIZE {
            return None;
        }

        // Echoes only ever leave on the path the challenge arrived on
        if let Some(pos) = self.responses.iter().position(|r| r.path == *path) {
            let response = self.responses.remove(pos);
            trace!("Sending PATH_RESPONSE on {}", path);
            return Some(OutgoingFrame::new(Frame::PathResponse { data: response.data }));
        }

        let job = self.jobs.get_mut(path)?;
        let data = job.next_unsent()?;
        let frame = OutgoingFrame::new(Frame::PathChallenge { data });
        self.sent_challenges.insert(frame.id, *path);
        trace!("Sending PATH_CHALLENGE on {}", path);
        Some(frame)
    }

    fn on_frame_acked(&mut self, id: FrameId) {
        self.sent_challenges.remove(&id);
    }

    fn on_frame_lost(&mut self, id: FrameId) {
        let Some(path) = self.sent_challenges.remove(&id) else {
            return;
        };
        if let Some(job) = self.jobs.get_mut(&path) {
            if job.state == ValidationState::Validating {
                debug!("PATH_CHALLENGE lost on {}, reissuing", path);
                job.issue_challenge();
            }
        }
    }
}
