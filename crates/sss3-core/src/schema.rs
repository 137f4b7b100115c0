//! Schema validation of broker payloads
//!
//! The broker's JSON documents are checked against a small set of named
//! schemas before they are trusted. The default validator expresses each
//! schema as a typed model with `validator` constraints; other validators
//! (e.g. a JSON-schema engine) can be plugged in through [`SchemaValidator`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use validator::Validate;

use crate::error::{CoreError, CoreResult};
use crate::models::{DeviceDescriptor, SessionInfo, SessionParameters};

/// Named schemas known to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    /// Array of device descriptors returned by `GET /sss3`
    DeviceList,
    /// Session setup pushed by the broker
    SessionInfo,
}

impl Schema {
    pub fn name(&self) -> &'static str {
        match self {
            Schema::DeviceList => "device-list",
            Schema::SessionInfo => "session-info",
        }
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Validates a JSON document against a named schema
#[cfg_attr(test, mockall::automock)]
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, document: &Value, schema: Schema) -> CoreResult<()>;
}

/// Validator backed by the typed models and their `validator` constraints
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedSchemaValidator;

impl TypedSchemaValidator {
    fn check<T: DeserializeOwned + Validate>(document: &Value, schema: Schema) -> CoreResult<T> {
        let typed: T = serde_json::from_value(document.clone())
            .map_err(|e| CoreError::violation(schema.name(), e.to_string()))?;
        typed
            .validate()
            .map_err(|e| CoreError::violation(schema.name(), e.to_string()))?;
        Ok(typed)
    }
}

impl SchemaValidator for TypedSchemaValidator {
    fn validate(&self, document: &Value, schema: Schema) -> CoreResult<()> {
        match schema {
            Schema::DeviceList => {
                let devices: Vec<DeviceDescriptor> = serde_json::from_value(document.clone())
                    .map_err(|e| CoreError::violation(schema.name(), e.to_string()))?;
                for (index, device) in devices.iter().enumerate() {
                    device.validate().map_err(|e| {
                        CoreError::violation(schema.name(), format!("item {}: {}", index, e))
                    })?;
                }
                Ok(())
            }
            Schema::SessionInfo => Self::check::<SessionInfo>(document, schema).map(|_| ()),
        }
    }
}

/// Decode a device-list body
///
/// An empty array is accepted as-is and never reaches the validator.
pub fn decode_device_list(
    body: &[u8],
    validator: &dyn SchemaValidator,
) -> CoreResult<Vec<DeviceDescriptor>> {
    let document: Value =
        serde_json::from_slice(body).map_err(|e| CoreError::MalformedBody(e.to_string()))?;

    if document.as_array().is_some_and(|items| items.is_empty()) {
        return Ok(Vec::new());
    }

    validator.validate(&document, Schema::DeviceList)?;
    serde_json::from_value(document).map_err(|e| CoreError::MalformedBody(e.to_string()))
}

/// Decode a session setup body into validated parameters
pub fn decode_session_setup(
    body: &[u8],
    validator: &dyn SchemaValidator,
) -> CoreResult<SessionParameters> {
    let document: Value =
        serde_json::from_slice(body).map_err(|e| CoreError::MalformedBody(e.to_string()))?;
    validator.validate(&document, Schema::SessionInfo)?;

    let info: SessionInfo =
        serde_json::from_value(document).map_err(|e| CoreError::MalformedBody(e.to_string()))?;
    SessionParameters::try_from(&info)
}
