//! Error types for control channel operations

use std::io;

use thiserror::Error;

use crate::http::ParseError;

/// Result type alias for control channel operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur on the control channel
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No connection is open
    #[error("Not connected to broker")]
    NotConnected,

    /// The broker closed the connection
    #[error("Broker closed the connection")]
    RemoteDisconnected,

    /// Request path is not a valid origin-form target
    #[error("Invalid request target: {0}")]
    InvalidRequestTarget(String),

    /// Bytes on the connection do not fit the expected exchange
    #[error("Improper connection state: {0}")]
    ImproperConnectionState(String),

    /// Any other I/O failure on the connection
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// Connect failed twice
    #[error("Broker {broker} unreachable: {reason}")]
    BrokerUnreachable { broker: String, reason: String },

    /// Registration failed twice
    #[error("Registration failed ({}): {reason}", describe_code(.code))]
    RegistrationFailed { code: Option<u16>, reason: String },

    /// Setup push failed validation; the connection is marked for closure
    #[error("Malformed push: {0}")]
    MalformedPush(String),

    /// Push with a method the client does not handle
    #[error("Unsupported push method: {0}")]
    UnsupportedPush(String),

    /// Bounded wait for a response elapsed
    #[error("Timed out waiting for broker")]
    Timeout,

    /// Wait aborted by the operator
    #[error("Cancelled")]
    Cancelled,
}

fn describe_code(code: &Option<u16>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "no response".to_string(),
    }
}

impl BrokerError {
    /// Classify an I/O error from the control connection
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotConnected => Self::NotConnected,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::RemoteDisconnected,
            _ => Self::Transport(error),
        }
    }

    pub fn registration_failed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            code,
            reason: reason.into(),
        }
    }

    /// Whether the connection can no longer be used
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::RemoteDisconnected | Self::Transport(_)
        )
    }
}

impl From<io::Error> for BrokerError {
    fn from(error: io::Error) -> Self {
        Self::from_io(error)
    }
}

impl From<sss3_transport::ReactorError> for BrokerError {
    fn from(error: sss3_transport::ReactorError) -> Self {
        match error {
            sss3_transport::ReactorError::Io(e) => Self::from_io(e),
            other => Self::ImproperConnectionState(other.to_string()),
        }
    }
}

impl From<ParseError> for BrokerError {
    fn from(error: ParseError) -> Self {
        Self::ImproperConnectionState(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(io::ErrorKind::NotConnected, "Not connected to broker")]
    #[case(io::ErrorKind::ConnectionReset, "Broker closed the connection")]
    #[case(io::ErrorKind::BrokenPipe, "Broker closed the connection")]
    fn test_io_classification(#[case] kind: io::ErrorKind, #[case] expected: &str) {
        let err = BrokerError::from(io::Error::from(kind));
        assert_eq!(err.to_string(), expected);
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_other_io_is_transport() {
        let err = BrokerError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, BrokerError::Transport(_)));
    }

    #[test]
    fn test_registration_failed_display() {
        let err = BrokerError::registration_failed(Some(403), "Forbidden");
        assert_eq!(err.to_string(), "Registration failed (403): Forbidden");

        let err = BrokerError::registration_failed(None, "Timed out waiting for broker");
        assert_eq!(
            err.to_string(),
            "Registration failed (no response): Timed out waiting for broker"
        );
    }
}
