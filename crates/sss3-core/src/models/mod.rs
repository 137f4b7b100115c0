//! Data model exchanged with the broker

mod device;
mod session;

pub use device::{DeviceDescriptor, RegistrationBody, SessionRequest};
pub use session::{SessionInfo, SessionParameters};
