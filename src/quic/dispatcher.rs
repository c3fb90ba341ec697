//! Routes decoded frames to the components that consume them

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::error::ConnectionError;
use super::frame::{Frame, FrameFactory, FrameType, WireFrameFactory, FRAME_TYPE_COUNT};
use super::types::{EncryptionLevel, Path};

/// A consumer of inbound frames
pub trait FrameHandler: Send {
    /// Frame types this handler wants to see
    fn interests(&self) -> &'static [FrameType];

    /// Handle a frame carried at `level` in a packet that arrived on `path`
    fn handle_frame(&mut self, level: EncryptionLevel, path: &Path, frame: &Frame) -> Result<(), ConnectionError>;
}

pub type SharedFrameHandler = Arc<Mutex<dyn FrameHandler>>;

/// What to do with bytes that follow a frame the factory cannot decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingBytesPolicy {
    /// Stop processing and keep what was dispatched so far
    #[default]
    Truncate,
    /// Treat undecodable bytes as FRAME_ENCODING_ERROR
    Reject,
}

/// Summary of one packet payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Only PADDING and ACK frames were seen
    pub ack_only: bool,
    /// A STREAM frame was seen
    pub is_flow_controlled: bool,
    /// Only probing frames were seen
    pub is_probing_only: bool,
    /// Number of frames dispatched
    pub frames: usize,
    /// Processing stopped early on undecodable bytes
    pub truncated: bool,
}

impl Default for ReceiveOutcome {
    fn default() -> Self {
        Self {
            ack_only: true,
            is_flow_controlled: false,
            is_probing_only: true,
            frames: 0,
            truncated: false,
        }
    }
}

pub struct FrameDispatcher {
    factory: Box<dyn FrameFactory>,
    handlers: [Vec<SharedFrameHandler>; FRAME_TYPE_COUNT],
    policy: TrailingBytesPolicy,
}

impl FrameDispatcher {
    pub fn new(factory: Box<dyn FrameFactory>) -> Self {
        Self {
            factory,
            handlers: std::array::from_fn(|_| Vec::new()),
            policy: TrailingBytesPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TrailingBytesPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register `handler` for every frame type it is interested in.
    /// Handlers are called in registration order.
    pub fn add_handler(&mut self, handler: SharedFrameHandler) {
        let interests = handler.lock().interests();
        for frame_type in interests {
            self.handlers[frame_type.index()].push(Arc::clone(&handler));
        }
    }

    pub fn handler_count(&self, frame_type: FrameType) -> usize {
        self.handlers[frame_type.index()].len()
    }

    /// Decode `payload` frame by frame and hand each frame to its handlers.
    ///
    /// The first handler error stops processing: neither later handlers for
    /// the same frame nor later frames are dispatched.
    pub fn receive_frames(
        &self,
        level: EncryptionLevel,
        path: &Path,
        payload: &[u8],
    ) -> Result<ReceiveOutcome, ConnectionError> {
        let mut outcome = ReceiveOutcome::default();
        let mut pos = 0;

        while pos < payload.len() {
            let (frame, consumed) = match self.factory.create(&payload[pos..]) {
                Ok((frame, consumed)) if consumed > 0 => (frame, consumed),
                Ok(_) => {
                    return self.undecodable(outcome, pos, payload.len(), "zero-length frame".to_string());
                }
                Err(err) => return self.undecodable(outcome, pos, payload.len(), err.to_string()),
            };
            pos += consumed;

            let frame_type = frame.frame_type();
            if !frame_type.permitted_at(level) {
                return Err(ConnectionError::protocol_violation(
                    frame_type,
                    format!("{:?} frame not permitted at {:?}", frame_type, level),
                ));
            }

            trace!("Dispatching {:?} received on {}", frame_type, path);
            outcome.frames += 1;
            if !matches!(frame_type, FrameType::Padding | FrameType::Ack) {
                outcome.ack_only = false;
            }
            if frame.is_flow_controlled() {
                outcome.is_flow_controlled = true;
            }
            if !frame.is_probing() {
                outcome.is_probing_only = false;
            }

            for handler in &self.handlers[frame_type.index()] {
                handler.lock().handle_frame(level, path, &frame)?;
            }
        }

        Ok(outcome)
    }

    fn undecodable(
        &self,
        mut outcome: ReceiveOutcome,
        pos: usize,
        len: usize,
        reason: String,
    ) -> Result<ReceiveOutcome, ConnectionError> {
        match self.policy {
            TrailingBytesPolicy::Truncate => {
                warn!(
                    "Dropping {} undecodable bytes at offset {}: {}",
                    len - pos,
                    pos,
                    reason
                );
                outcome.truncated = true;
                Ok(outcome)
            }
            TrailingBytesPolicy::Reject => Err(ConnectionError::frame_encoding(format!(
                "undecodable frame at offset {}: {}",
                pos, reason
            ))),
        }
    }
}

impl Default for FrameDispatcher {
    fn default() -> Self {
        Self::new(Box::new(WireFrameFactory))
    }
}

impl fmt::Debug for FrameDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<_> = FrameType::ALL
            .iter()
            .filter(|t| !self.handlers[t.index()].is_empty())
            .map(|t| (*t, self.handlers[t.index()].len()))
            .collect();
        f.debug_struct("FrameDispatcher")
            .field("handlers", &registered)
            .field("policy", &self.policy)
            .finish()
    }
}
