//! Control channel to the SSS3 session broker
//!
//! The broker arbitrates ECU allocation. The client keeps one persistent
//! HTTP/1.1 connection open to it and uses it both ways:
//!
//! | Exchange        | Direction       | Method/Path              |
//! |-----------------|-----------------|--------------------------|
//! | Register        | client → broker | `POST /client/register`  |
//! | List devices    | client → broker | `GET /sss3`              |
//! | Request session | client → broker | `POST /client/session`   |
//! | Setup push      | broker → client | `POST`                   |
//! | Teardown push   | broker → client | `DELETE`                 |
//! | End session     | client → broker | `DELETE /session`        |
//! | Deregister      | client → broker | `DELETE /client/register`|
//!
//! Responses are awaited through the shared [`sss3_transport::Reactor`];
//! pushes are parsed from the same byte stream by a small HTTP parser
//! ([`http`]) rather than by a server framework.

pub mod channel;
pub mod error;
pub mod http;
pub mod listener;
pub mod push;
pub mod testing;

pub use channel::{
    ChannelConfig, ControlChannel, SessionOutcome, DEVICES_PATH, REGISTER_PATH, SESSION_PATH,
    SESSION_REQUEST_PATH,
};
pub use error::{BrokerError, Result};
pub use http::{Message, PushedRequest, Request, Response};
pub use listener::PushListener;
pub use push::PushEvent;
