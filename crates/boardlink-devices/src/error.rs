/*!
 * Error types for device operations.
 */
use std::io;

use thiserror::Error;

use boardlink_core::error::Error as CoreError;

/// Error type for transports, drivers, sessions and supervisors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The endpoint could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A binary frame failed its checksum
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },

    /// The driver has no command for this endpoint
    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// An argument is missing, of the wrong type, or cannot be framed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device answered with ERR/ERROR/NAK
    #[error("Rejected by device: {0}")]
    Rejected(String),

    /// The session handshake failed
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// No registered driver recognised the device
    #[error("No driver matched the device")]
    NoMatch,

    /// There is no live session or transport
    #[error("Not connected")]
    NotConnected,

    /// The session hit an unrecoverable protocol or transport error
    #[error("Session faulted: {0}")]
    Faulted(String),

    /// The session or transport was closed
    #[error("Closed")]
    Closed,

    /// The operation was cancelled by its caller
    #[error("Cancelled")]
    Cancelled,

    /// Reconnection attempts are exhausted
    #[error("Permanently failed after {attempts} attempts")]
    PermanentlyFailed {
        /// Consecutive failed attempts
        attempts: u32,
    },

    /// The supervisor is already running
    #[error("Already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Connection(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Timeout(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Protocol(msg.as_ref().to_string())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Config(msg.as_ref().to_string())
    }

    /// Whether this is a timeout, from either the transport or the core helpers
    pub fn is_timeout(&self) -> bool {
        match self {
            DeviceError::Timeout(_) | DeviceError::Core(CoreError::Timeout(_)) => true,
            DeviceError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether a read loop may keep going after this error
    ///
    /// Timeouts and interrupted or would-block I/O are transient; everything
    /// else (EOF, reset, cancellation) ends the loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            other => other.is_timeout(),
        }
    }

    /// An unexpected end of stream
    pub fn eof() -> Self {
        DeviceError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DeviceError::timeout("read").is_retryable());
        assert!(DeviceError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_retryable());
        assert!(DeviceError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_retryable());
        assert!(DeviceError::Core(CoreError::timeout("x")).is_retryable());

        assert!(!DeviceError::eof().is_retryable());
        assert!(!DeviceError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!DeviceError::Cancelled.is_retryable());
        assert!(!DeviceError::protocol("garbage").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = DeviceError::Checksum { expected: 0xAA, actual: 0x01 };
        assert_eq!(err.to_string(), "Checksum mismatch: expected 0xAA, got 0x01");
        assert_eq!(
            DeviceError::PermanentlyFailed { attempts: 10 }.to_string(),
            "Permanently failed after 10 attempts"
        );
    }

    #[test]
    fn test_core_error_conversion() {
        let err: DeviceError = CoreError::config("bad").into();
        assert!(matches!(err, DeviceError::Core(CoreError::Config(_))));
    }
}
