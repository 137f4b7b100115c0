//! Transport layer for the SSS3 session client
//!
//! This crate provides the two I/O building blocks the session layer drives:
//! - [`Reactor`]: readiness-based multiplexing of socket handles with
//!   per-handle callback dispatch, shareable across threads
//! - [`DataPlane`]: the pair of UDP multicast sockets that carry telemetry
//!   frames while a session is active
//!
//! Sockets are identified by their raw file descriptor, so this crate is
//! Unix-only.

pub mod error;
pub mod multicast;
pub mod reactor;

pub use error::{DataPlaneError, DataPlaneResult, ReactorError, ReactorResult};
pub use multicast::{
    CanReceiver, CarlaSender, ChannelConsumer, DataPlane, DataPlaneConfig, DataPlaneStats,
    FrameConsumer, ReceiveTimeout, StatsSnapshot, open_multicast,
};
pub use reactor::{EventHandler, Handle, Interest, Reactor, ReadyEvent, Readiness};
