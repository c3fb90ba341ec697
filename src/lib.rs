// Connection migration, path validation and connection ID management
pub mod quic;

// Configuration loading and validation
pub mod config;

// Logging bootstrap
pub mod observability;

// Re-export main types
pub use config::Config;
pub use quic::{
    AltConnectionIdManager, ConnectionHandle, ConnectionId, FrameDispatcher, MigrationController, Path,
    PathManager, PathValidator, ResetTokenTable, StatelessRetry,
};

pub mod prelude {
    pub use crate::config::{Config, LoggingConfig, MigrationConfig, RetryConfig};
    pub use crate::observability::init_tracing;
    pub use crate::quic::{
        AltConnectionIdManager, ConnectionHandle, ConnectionId, ConnectionRegistry, EncryptionLevel, EventSink, Frame,
        FrameDispatcher, FrameGenerator, FrameHandler, MigrationController, MigrationEvent, Path, PathManager,
        PathValidator, ResetTokenTable, SharedTables, StatelessResetToken, StatelessRetry,
    };
    pub use crate::quic::error::{QuicError, Result};
}
