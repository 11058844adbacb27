//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while talking to the sensor, reading saved
//! measurement files, or correcting a size axis.
//!
//! ## Error Hierarchy
//!
//! - **Transport faults**: `SerialPortNotConnected`, `SerialTimeout`,
//!   `SerialUnexpectedEof`, `SerialFeatureDisabled` and `Io`.
//! - **Decode faults**: `Decode`. The codec normally records these as
//!   [`crate::protocol::DecodeFault`] values instead of returning them; the
//!   variant exists for callers that want to escalate a fault.
//! - **Calibration faults**: `Calibration`, raised when a lookup table lacks the
//!   requested refractive index or cannot be parsed.
//! - **Configuration**: `Config` wraps figment load errors, `Configuration`
//!   carries semantic validation failures.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("No answer to '{command}' after {attempts} empty reads")]
    SerialTimeout { command: String, attempts: u32 },

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Decode error ({command}): {detail}")]
    Decode { command: String, detail: String },

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Feature '{0}' is enabled but not yet implemented. {1}")]
    FeatureIncomplete(String, String),

    #[error("Invalid acquisition transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("laser failed".to_string());
        assert_eq!(err.to_string(), "Instrument error: laser failed");
    }

    #[test]
    fn test_serial_timeout_display() {
        let err = DaqError::SerialTimeout {
            command: "C0012".into(),
            attempts: 5,
        };
        assert_eq!(err.to_string(), "No answer to 'C0012' after 5 empty reads");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt");
        let err: DaqError = io.into();
        assert!(matches!(err, DaqError::Io(_)));
        assert!(err.to_string().contains("missing.txt"));
    }
}
