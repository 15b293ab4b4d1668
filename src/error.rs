//! Error types and handling for Powerwatch
//!
//! Every fallible operation in the crate returns [`Result`]. Errors raised
//! inside a polling cycle are transient and are contained by the owning
//! loop; configuration errors are only fatal at startup.

use thiserror::Error;

/// Result type alias for Powerwatch operations
pub type Result<T> = std::result::Result<T, PowerwatchError>;

/// Main error type for Powerwatch
#[derive(Debug, Error)]
pub enum PowerwatchError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// The device refused or dropped the connection
    #[error("Connection refused: {message}")]
    ConnectionRefused { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Malformed or unexpected frames from the device
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Schedule source could not be reached
    #[error("Unreachable: {message}")]
    Unreachable { message: String },

    /// Schedule document could not be parsed
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl PowerwatchError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        PowerwatchError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new connection refused error
    pub fn connection_refused<S: Into<String>>(message: S) -> Self {
        PowerwatchError::ConnectionRefused {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new unreachable error
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Unreachable {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Parse {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        PowerwatchError::Generic {
            message: message.into(),
        }
    }

    /// Whether the failure is expected to clear up on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PowerwatchError::ConnectionRefused { .. }
                | PowerwatchError::Timeout { .. }
                | PowerwatchError::Protocol { .. }
                | PowerwatchError::Unreachable { .. }
                | PowerwatchError::Parse { .. }
                | PowerwatchError::Io { .. }
        )
    }
}

impl From<std::io::Error> for PowerwatchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => {
                PowerwatchError::connection_refused(err.to_string())
            }
            std::io::ErrorKind::TimedOut => PowerwatchError::timeout(err.to_string()),
            _ => PowerwatchError::io(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for PowerwatchError {
    fn from(err: serde_yaml::Error) -> Self {
        PowerwatchError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PowerwatchError {
    fn from(err: serde_json::Error) -> Self {
        PowerwatchError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "outage-http")]
impl From<reqwest::Error> for PowerwatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PowerwatchError::timeout(err.to_string())
        } else {
            PowerwatchError::unreachable(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for PowerwatchError {
    fn from(err: chrono::ParseError) -> Self {
        PowerwatchError::validation("datetime".to_string(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PowerwatchError::config("test config error");
        assert!(matches!(err, PowerwatchError::Config { .. }));

        let err = PowerwatchError::protocol("bad crc");
        assert!(matches!(err, PowerwatchError::Protocol { .. }));

        let err = PowerwatchError::validation("field", "test validation error");
        assert!(matches!(err, PowerwatchError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PowerwatchError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = PowerwatchError::validation("device.ip", "must not be empty");
        assert_eq!(
            format!("{}", err),
            "Validation error: device.ip - must not be empty"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PowerwatchError::timeout("read").is_transient());
        assert!(PowerwatchError::unreachable("fetch").is_transient());
        assert!(PowerwatchError::parse("html").is_transient());
        assert!(!PowerwatchError::config("missing ip").is_transient());
    }

    #[test]
    fn test_io_error_kinds_map_to_transport_errors() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            PowerwatchError::from(refused),
            PowerwatchError::ConnectionRefused { .. }
        ));
        let slow = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            PowerwatchError::from(slow),
            PowerwatchError::Timeout { .. }
        ));
    }
}
