use super::frame::{Frame, FrameId};
use super::types::{EncryptionLevel, Path};

/// A frame produced for an outgoing packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub id: FrameId,
    pub frame: Frame,
}

impl OutgoingFrame {
    pub fn new(frame: Frame) -> Self {
        Self {
            id: FrameId::next(),
            frame,
        }
    }
}

/// A producer of frames, polled by the packet builder each time it has room
/// in a packet for `level` that will be sent on `path`
pub trait FrameGenerator: Send {
    fn will_generate_frame(&self, level: EncryptionLevel, path: &Path) -> bool;

    /// Produce at most one frame no larger than `max_frame_size`
    fn generate_frame(&mut self, level: EncryptionLevel, path: &Path, max_frame_size: usize) -> Option<OutgoingFrame>;

    fn on_frame_acked(&mut self, _id: FrameId) {}

    fn on_frame_lost(&mut self, _id: FrameId) {}
}
