//! SSS3 session controller
//!
//! Ties the broker control channel and the multicast data plane together
//! into the client state machine:
//!
//! ```text
//! connect -> register -> GET /sss3 -> select -> POST /client/session
//!         -> setup push -> data plane -> DELETE /session -> DELETE /client/register
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sss3_session::{ClientConfig, FixedSelection, SessionController};
//!
//! let config = ClientConfig::default().with_broker("broker:80");
//! let controller = SessionController::builder(config, Arc::new(FixedSelection(vec![1]))).build()?;
//! let summary = controller.run()?;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod state;

pub use config::ClientConfig;
pub use controller::{SessionBuilder, SessionController, SessionEnd, SessionSummary, StopHandle};
pub use error::{SessionError, SessionResult};
pub use observer::{DeviceSelector, FixedSelection, LogObserver, SessionObserver, StatusLevel};
pub use state::ConnectionState;
