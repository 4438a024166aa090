//! Serial terminal errors

use thiserror::Error;

/// Errors that can occur while talking to a serial device
#[derive(Error, Debug)]
pub enum SerialError {
    /// Configuration no device could accept
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to open the device
    #[error("Failed to open port {port}: {reason}")]
    Open {
        /// Port that was requested
        port: String,
        /// Busy, missing, permission denied and so on
        reason: String,
    },

    /// No open handle
    #[error("Serial port is not connected")]
    NotConnected,

    /// The transport rejected a write
    #[error("Failed to send data: {0}")]
    Write(String),

    /// The connection broke while reading
    #[error("Read error: {0}")]
    Read(String),

    /// A batch is already being sent
    #[error("A send is already in progress")]
    AlreadySending,

    /// Settings could not be parsed
    #[error("Settings error: {0}")]
    Settings(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SerialError>;

impl SerialError {
    /// Whether this error means the connection can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, SerialError::Read(_) | SerialError::NotConnected)
    }
}

/// Turn a serialport open failure into a human-readable cause
pub(crate) fn describe_open_error(err: &serialport::Error) -> String {
    use serialport::ErrorKind;
    match err.kind() {
        ErrorKind::NoDevice => format!("device not found or busy ({})", err.description),
        ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            format!("permission denied ({})", err.description)
        }
        ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            format!("device not found ({})", err.description)
        }
        ErrorKind::InvalidInput => format!("invalid port settings ({})", err.description),
        _ => err.description.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_display() {
        let err = SerialError::Open {
            port: "/dev/ttyUSB0".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open port /dev/ttyUSB0: permission denied"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SerialError::Read("broken pipe".into()).is_fatal());
        assert!(SerialError::NotConnected.is_fatal());
        assert!(!SerialError::Write("timeout".into()).is_fatal());
        assert!(!SerialError::AlreadySending.is_fatal());
    }

    #[test]
    fn test_describe_permission_denied() {
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "EACCES",
        );
        assert_eq!(describe_open_error(&err), "permission denied (EACCES)");
    }
}
