//! Error types for the PeliCAN driver core

use thiserror::Error;

use crate::device::SessionId;

#[derive(Error, Debug)]
pub enum CanError {
    #[error("Invalid payload length: {0} (maximum is 8)")]
    InvalidLength(usize),

    #[error("Invalid identifier 0x{id:X} for {} format", format_name(.extended))]
    InvalidIdentifier { id: u32, extended: bool },

    #[error("Register window too small: {len} bytes, chip needs {required}")]
    RegisterWindow { len: usize, required: usize },

    #[error("Invalid chip state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Controller did not enter reset mode after {polls} polls")]
    ResetNotAcknowledged { polls: usize },

    #[error("Bit timing change refused: {sessions} sessions open at {current} kbit/s, requested {requested} kbit/s")]
    ConfigurationBusy {
        sessions: usize,
        current: u32,
        requested: u32,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Notification delivery failed: {0}")]
    NotificationFailed(String),

    #[error(transparent)]
    Config(#[from] pelican_common::Error),
}

pub type Result<T> = std::result::Result<T, CanError>;

fn format_name(extended: &bool) -> &'static str {
    if *extended {
        "extended"
    } else {
        "standard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_length_error() {
        let err = CanError::InvalidLength(9);
        assert_eq!(err.to_string(), "Invalid payload length: 9 (maximum is 8)");
    }

    #[test]
    fn test_invalid_identifier_error() {
        let err = CanError::InvalidIdentifier {
            id: 0x800,
            extended: false,
        };
        assert_eq!(
            err.to_string(),
            "Invalid identifier 0x800 for standard format"
        );
    }

    #[test]
    fn test_configuration_busy_error() {
        let err = CanError::ConfigurationBusy {
            sessions: 2,
            current: 250,
            requested: 500,
        };
        assert!(err.to_string().contains("2 sessions open at 250 kbit/s"));
    }

    #[test]
    fn test_reset_not_acknowledged_error() {
        let err = CanError::ResetNotAcknowledged { polls: 100 };
        assert_eq!(
            err.to_string(),
            "Controller did not enter reset mode after 100 polls"
        );
    }

    #[test]
    fn test_from_common_error() {
        let common = pelican_common::Error::config("bad bitrate");
        let err: CanError = common.into();
        assert!(matches!(err, CanError::Config(_)));
        assert!(err.to_string().contains("bad bitrate"));
    }
}
