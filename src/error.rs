//! Error handling for the ventilator console
//!
//! [`SessionError`] covers everything the operator-facing API and the serial
//! link can fail with. [`DecodeError`] is kept separate because bad telemetry
//! lines are expected noise on the link: the poll loop counts and drops them
//! instead of surfacing each one.

use thiserror::Error;

/// Main error type for console operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The device path is absent or busy
    #[error("Connection error: {0}")]
    Connection(String),

    /// `start` was called while a session is already running
    #[error("A ventilation session is already active")]
    AlreadyActive,

    /// `update` was called without an active session
    #[error("No active ventilation session")]
    NotActive,

    /// The link kept failing past the consecutive-failure cap
    #[error("Device lost after {failures} consecutive link failures: {last_error}")]
    DeviceLost { failures: u32, last_error: String },

    /// A line received from the device could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Errors related to the alarm actuator
    #[error("Alarm actuator error: {0}")]
    Actuator(String),

    /// A parameter outside its accepted range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors on the serial link or the filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SessionError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for failures of the link itself, as opposed to bad data on it
    pub fn is_link_failure(&self) -> bool {
        match self {
            SessionError::Io(_) => true,
            SessionError::WithContext { source, .. } => source.is_link_failure(),
            _ => false,
        }
    }
}

impl From<serialport::Error> for SessionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => SessionError::Io(std::io::Error::new(kind, err)),
            _ => SessionError::Connection(err.to_string()),
        }
    }
}

/// Why a telemetry or command line was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Wrong number of comma-separated fields
    #[error("Malformed record: expected {expected} fields, got {found}")]
    MalformedRecord { expected: usize, found: usize },

    /// A numeric field did not parse as a finite real
    #[error("Field {index} is not a number: {text:?}")]
    NumericParse { index: usize, text: String },

    /// A command line with a tag the console never emits
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
}

/// Result type alias for console operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SessionError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SessionError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::Connection("/dev/ttyACM0 busy".to_string());
        assert_eq!(err.to_string(), "Connection error: /dev/ttyACM0 busy");
    }

    #[test]
    fn test_error_with_context() {
        let err = SessionError::NotActive;
        let with_ctx = err.with_context("Failed to update settings");
        assert!(with_ctx.to_string().contains("Failed to update settings"));
    }

    #[test]
    fn test_link_failure_classification() {
        let io = SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read timed out",
        ));
        assert!(io.is_link_failure());
        assert!(io.with_context("poll").is_link_failure());

        let decode = SessionError::Decode(DecodeError::MalformedRecord {
            expected: 9,
            found: 3,
        });
        assert!(!decode.is_link_failure());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::NumericParse {
            index: 4,
            text: "x".to_string(),
        };
        assert!(err.to_string().contains("Field 4"));
    }
}
