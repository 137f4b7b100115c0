//! Connection state of the client

use serde::{Deserialize, Serialize};

/// Protocol progress of the one session a client process runs
///
/// ```text
/// Disconnected -> Connected -> Registering -> Registered -> AwaitingDevices
///   -> AwaitingPush -> SessionActive -> Closing -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Registering,
    Registered,
    AwaitingDevices,
    AwaitingPush,
    SessionActive,
    Closing,
}

impl ConnectionState {
    /// Whether a control connection is expected to be open
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Registering => "registering",
            ConnectionState::Registered => "registered",
            ConnectionState::AwaitingDevices => "awaiting devices",
            ConnectionState::AwaitingPush => "awaiting setup",
            ConnectionState::SessionActive => "session active",
            ConnectionState::Closing => "closing",
        };
        write!(f, "{}", s)
    }
}
