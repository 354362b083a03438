//! Error types for the tunnel server.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel server.
#[derive(Error, Debug)]
pub enum Error {
    /// A TUN device could not be created.
    #[error("TUN device unavailable: {0}")]
    DeviceUnavailable(String),

    /// An interface could not be addressed or brought up.
    #[error("Interface configuration failed: {0}")]
    ConfigurationFailed(String),

    /// A length prefix outside the framing domain.
    #[error("Invalid frame length {0}")]
    InvalidFrameLength(u32),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a raw I/O error is safe to retry in place: an interrupted
/// syscall or an empty non-blocking operation.
pub fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}
