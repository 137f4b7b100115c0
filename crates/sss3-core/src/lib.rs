//! sss3-core - Core types for the SSS3 session client
//!
//! This crate holds the pieces shared by every layer of the client:
//! the data model exchanged with the broker, the fixed 20-byte telemetry
//! frame codec, schema validation of broker payloads, and the small
//! collaborator traits (identity, clock) the session layer consumes.

pub mod clock;
pub mod error;
pub mod frame;
pub mod identity;
pub mod models;
pub mod schema;

pub use clock::{ClockSource, SystemClock};
pub use error::{CoreError, CoreResult};
pub use frame::{Frame, ReceivedFrame, FRAME_SIZE};
pub use identity::{Identity, IdentityProvider, StaticIdentity, DEFAULT_MAC};
pub use models::*;
pub use schema::{
    decode_device_list, decode_session_setup, Schema, SchemaValidator, TypedSchemaValidator,
};
