//! Session controller errors

use thiserror::Error;

use crate::state::ConnectionState;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Control channel failure
    #[error(transparent)]
    Broker(#[from] sss3_broker::BrokerError),

    /// Multicast sockets could not be opened or used
    #[error(transparent)]
    DataPlane(#[from] sss3_transport::DataPlaneError),

    #[error(transparent)]
    Reactor(#[from] sss3_transport::ReactorError),

    /// Operation attempted outside its valid state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// The data-plane worker thread could not be started
    #[error("Failed to start data plane worker: {0}")]
    Worker(#[source] std::io::Error),
}

impl SessionError {
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }
}
