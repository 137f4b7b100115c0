//! Transport layer errors

use thiserror::Error;

use crate::reactor::Handle;

/// Result type for reactor operations
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Result type for data plane operations
pub type DataPlaneResult<T> = Result<T, DataPlaneError>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Handle {0} is already registered")]
    DuplicateRegistration(Handle),

    #[error("Handle {0} is not registered")]
    NotRegistered(Handle),

    #[error("Reactor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DataPlaneError {
    /// Socket setup, group join or reactor registration failed
    #[error("Data plane start failed on port {port}: {source}")]
    DataPlaneStartFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Data plane is not running")]
    NotStarted,

    #[error("Data plane I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataPlaneError {
    pub fn start_failed(port: u16, source: impl Into<std::io::Error>) -> Self {
        Self::DataPlaneStartFailed {
            port,
            source: source.into(),
        }
    }
}

impl From<ReactorError> for std::io::Error {
    fn from(err: ReactorError) -> Self {
        match err {
            ReactorError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
