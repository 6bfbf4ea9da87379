//! Error types and handling for Hestia
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Hestia operations
pub type Result<T> = std::result::Result<T, HestiaError>;

/// Main error type for Hestia
#[derive(Debug, Error)]
pub enum HestiaError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// BMS wire-protocol errors (bad frame, checksum mismatch, layout)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serial transport errors
    #[error("Serial error: {message}")]
    Serial { message: String },

    /// Meter aggregator errors
    #[error("Meter error: {message}")]
    Meter { message: String },

    /// Inverter driver errors
    #[error("Inverter error: {message}")]
    Inverter { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HestiaError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HestiaError::Config {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        HestiaError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new serial transport error
    pub fn serial<S: Into<String>>(message: S) -> Self {
        HestiaError::Serial {
            message: message.into(),
        }
    }

    /// Create a new meter error
    pub fn meter<S: Into<String>>(message: S) -> Self {
        HestiaError::Meter {
            message: message.into(),
        }
    }

    /// Create a new inverter error
    pub fn inverter<S: Into<String>>(message: S) -> Self {
        HestiaError::Inverter {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HestiaError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HestiaError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HestiaError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HestiaError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error came from the transport layer (serial/network I/O).
    ///
    /// Transport failures force a reconnect of the owning connection; protocol
    /// failures do not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HestiaError::Serial { .. } | HestiaError::Io { .. } | HestiaError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for HestiaError {
    fn from(err: std::io::Error) -> Self {
        HestiaError::io(err.to_string())
    }
}

impl From<serialport::Error> for HestiaError {
    fn from(err: serialport::Error) -> Self {
        HestiaError::serial(err.to_string())
    }
}

impl From<reqwest::Error> for HestiaError {
    fn from(err: reqwest::Error) -> Self {
        HestiaError::meter(err.to_string())
    }
}

impl From<serde_yaml::Error> for HestiaError {
    fn from(err: serde_yaml::Error) -> Self {
        HestiaError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HestiaError {
    fn from(err: serde_json::Error) -> Self {
        HestiaError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HestiaError::config("test config error");
        assert!(matches!(err, HestiaError::Config { .. }));

        let err = HestiaError::protocol("test protocol error");
        assert!(matches!(err, HestiaError::Protocol { .. }));

        let err = HestiaError::validation("field", "test validation error");
        assert!(matches!(err, HestiaError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = HestiaError::config("test error");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Configuration error: test error");

        let err = HestiaError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }

    #[test]
    fn test_transport_classification() {
        assert!(HestiaError::serial("port gone").is_transport());
        assert!(HestiaError::timeout("no reply").is_transport());
        assert!(!HestiaError::protocol("checksum mismatch").is_transport());
    }
}
