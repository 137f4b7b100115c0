//! Broker-initiated pushes
//!
//! The broker reuses HTTP methods as message discriminators:
//! `POST` carries the session setup, `DELETE` tears the session down.

use serde::Serialize;
use sss3_core::{decode_session_setup, SchemaValidator, SessionParameters};

use crate::error::{BrokerError, Result};
use crate::http::PushedRequest;

/// Method of the setup push
pub const SETUP_METHOD: &str = "POST";
/// Method of the teardown push
pub const TEARDOWN_METHOD: &str = "DELETE";

/// A validated push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    /// Multicast parameters of the newly allocated session
    Setup(SessionParameters),
    /// The broker ended the session
    Teardown,
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Setup(_) => "setup",
            PushEvent::Teardown => "teardown",
        }
    }
}

/// Map a pushed request onto a [`PushEvent`]
///
/// This only interprets the message; updating the session parameters and
/// flagging the connection is the channel's job.
pub fn interpret(request: &PushedRequest, validator: &dyn SchemaValidator) -> Result<PushEvent> {
    match request.method.as_str() {
        SETUP_METHOD => decode_session_setup(&request.body, validator)
            .map(PushEvent::Setup)
            .map_err(|e| BrokerError::MalformedPush(e.to_string())),
        TEARDOWN_METHOD => Ok(PushEvent::Teardown),
        other => Err(BrokerError::UnsupportedPush(other.to_string())),
    }
}

/// Whether a response body carries an embedded setup push
///
/// The broker may answer `POST /client/session` with the setup document
/// itself instead of pushing it later.
pub fn is_embedded_setup(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.as_object().map(|object| object.contains_key("IP")))
        .unwrap_or(false)
}
