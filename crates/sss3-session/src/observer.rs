//! Collaborators the controller reports to and asks for input

use sss3_core::DeviceDescriptor;
use tracing::{error, info, warn};

use crate::state::ConnectionState;

/// Severity of a human-readable status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Receives progress of a session for presentation
pub trait SessionObserver: Send + Sync {
    /// A human-readable status line
    fn status(&self, level: StatusLevel, message: &str);

    /// The devices currently offered by the broker
    fn devices(&self, _devices: &[DeviceDescriptor]) {}

    fn state_changed(&self, _from: ConnectionState, _to: ConnectionState) {}
}

/// Writes status lines to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn status(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Info | StatusLevel::Success => info!("{}", message),
            StatusLevel::Warning => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }
    }
}

/// Asks which of the offered devices to request
#[cfg_attr(test, mockall::automock)]
pub trait DeviceSelector: Send + Sync {
    /// Device ids to request, or `None` to give up
    fn select(&self, devices: &[DeviceDescriptor]) -> Option<Vec<u32>>;
}

/// Always requests the same ids
#[derive(Debug, Clone, Default)]
pub struct FixedSelection(pub Vec<u32>);

impl DeviceSelector for FixedSelection {
    fn select(&self, _devices: &[DeviceDescriptor]) -> Option<Vec<u32>> {
        Some(self.0.clone())
    }
}
