//! Error types and handling for Helios
//!
//! This module defines the error types used throughout the controller,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;

/// Main error type for Helios
#[derive(Debug, Error)]
pub enum HeliosError {
    /// Static configuration file errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// No answer from the charging station before the command deadline
    #[error("Transport timeout: {message}")]
    TransportTimeout { message: String },

    /// Socket or queue failure below the protocol layer
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Response shape does not match the report that was requested
    #[error("Protocol mismatch: {message}")]
    ProtocolMismatch { message: String },

    /// The charging station answered a command with its error sentinel
    #[error("Device rejected command: {message}")]
    DeviceRejected { message: String },

    /// No charging station address configured
    #[error("Charging station address is not configured")]
    DeviceNotConfigured,

    /// Battery interlock command line missing for the requested action
    #[error("Interlock command not configured: {action}")]
    InterlockNotConfigured { action: String },

    /// Battery interlock command could not be executed or exited non-zero
    #[error("Interlock command failed: {message}")]
    InterlockCommandFailed { message: String },

    /// Stored strategy configuration failed validation
    #[error("Invalid strategy configuration: {message}")]
    ConfigInvalid { message: String },

    /// Energy meter live data unavailable or stale
    #[error("Meter error: {message}")]
    Meter { message: String },

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

impl HeliosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HeliosError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        HeliosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new transport timeout error
    pub fn transport_timeout<S: Into<String>>(message: S) -> Self {
        HeliosError::TransportTimeout {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        HeliosError::Transport {
            message: message.into(),
        }
    }

    /// Create a new protocol mismatch error
    pub fn protocol_mismatch<S: Into<String>>(message: S) -> Self {
        HeliosError::ProtocolMismatch {
            message: message.into(),
        }
    }

    /// Create a new device rejection error
    pub fn device_rejected<S: Into<String>>(message: S) -> Self {
        HeliosError::DeviceRejected {
            message: message.into(),
        }
    }

    /// Create a new interlock-not-configured error
    pub fn interlock_not_configured<S: Into<String>>(action: S) -> Self {
        HeliosError::InterlockNotConfigured {
            action: action.into(),
        }
    }

    /// Create a new interlock command failure
    pub fn interlock_failed<S: Into<String>>(message: S) -> Self {
        HeliosError::InterlockCommandFailed {
            message: message.into(),
        }
    }

    /// Create a new invalid strategy configuration error
    pub fn config_invalid<S: Into<String>>(message: S) -> Self {
        HeliosError::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create a new meter error
    pub fn meter<S: Into<String>>(message: S) -> Self {
        HeliosError::Meter {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HeliosError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HeliosError::Generic {
            message: message.into(),
        }
    }

    /// Whether the error came from the device round trip (timeout, socket,
    /// unexpected answer). These abandon a cycle and wait for the next tick.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HeliosError::TransportTimeout { .. }
                | HeliosError::Transport { .. }
                | HeliosError::ProtocolMismatch { .. }
                | HeliosError::DeviceRejected { .. }
        )
    }
}

impl From<std::io::Error> for HeliosError {
    fn from(err: std::io::Error) -> Self {
        HeliosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliosError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "meter-http")]
impl From<reqwest::Error> for HeliosError {
    fn from(err: reqwest::Error) -> Self {
        HeliosError::meter(err.to_string())
    }
}
