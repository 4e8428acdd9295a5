//! Error types and handling for the Sinapsi Alfa driver
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, AlfaError>;

/// Main error type for the Sinapsi Alfa driver
#[derive(Debug, Error)]
pub enum AlfaError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level errors: refused, reset, probe failed, retries exhausted
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-level errors: device exceptions, malformed replies
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl AlfaError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        AlfaError::Config {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        AlfaError::Connection {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        AlfaError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        AlfaError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        AlfaError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        AlfaError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        AlfaError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error is transport-level (the tracker reports these
    /// as "unreachable" rather than "not responding")
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            AlfaError::Connection { .. } | AlfaError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for AlfaError {
    fn from(err: std::io::Error) -> Self {
        AlfaError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for AlfaError {
    fn from(err: serde_yaml::Error) -> Self {
        AlfaError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AlfaError {
    fn from(err: serde_json::Error) -> Self {
        AlfaError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for AlfaError {
    fn from(err: chrono::ParseError) -> Self {
        AlfaError::validation("datetime".to_string(), err.to_string())
    }
}
