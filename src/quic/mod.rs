//! QUIC connection migration and path validation
//!
//! This module contains the frame dispatcher, path validation, the
//! path manager, alternate connection ID management, stateless reset token
//! lookup and stateless retry cookies.

pub mod alt_cid;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod frame;
pub mod generator;
pub mod migration;
pub mod path_manager;
pub mod path_validator;
pub mod registry;
pub mod reset_token;
pub mod retry;
pub mod types;

// Re-export commonly used items
pub use alt_cid::{AltCidSettings, AltConnectionIdManager, PreferredAddress};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{FrameDispatcher, FrameHandler, ReceiveOutcome, SharedFrameHandler, TrailingBytesPolicy};
pub use error::{ConnectionError, CryptoError, ProtocolError, QuicError, Result, TransportErrorCode};
pub use events::{EventSink, MigrationEvent};
pub use frame::{Frame, FrameFactory, FrameId, FrameType, WireFrameFactory};
pub use generator::{FrameGenerator, OutgoingFrame};
pub use migration::{MigrationController, SharedTables};
pub use path_manager::PathManager;
pub use path_validator::{PathValidator, ValidationState};
pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionTable};
pub use reset_token::ResetTokenTable;
pub use retry::StatelessRetry;
pub use types::{ConnectionId, EncryptionLevel, Path, ResetTokenKey, StatelessResetToken};
