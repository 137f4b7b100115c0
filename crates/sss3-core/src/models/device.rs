//! Device (ECU) descriptors and the requests built from them

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::identity::Identity;

/// An allocatable ECU as advertised by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeviceDescriptor {
    /// Broker-assigned device identifier
    #[serde(rename = "ID")]
    pub id: u32,
    /// ECU type (e.g. "Engine")
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub device_type: String,
    #[validate(length(min = 1))]
    pub year: String,
    #[validate(length(min = 1))]
    pub make: String,
    #[validate(length(min = 1))]
    pub model: String,
}

/// Body of `POST /client/register`
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationBody<'a> {
    #[serde(rename = "MAC")]
    pub mac: &'a str,
}

impl<'a> RegistrationBody<'a> {
    pub fn new(identity: &'a Identity) -> Self {
        Self {
            mac: identity.as_str(),
        }
    }
}

/// Body of `POST /client/session`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "ECUs")]
    pub ecus: Vec<DeviceDescriptor>,
}

impl SessionRequest {
    /// Build a request for the devices in `available` whose id is listed in `requested`
    ///
    /// Descriptors keep the order the broker reported them in, regardless of
    /// the order of `requested`.
    pub fn new(identity: &Identity, requested: &[u32], available: &[DeviceDescriptor]) -> Self {
        let ecus = available
            .iter()
            .filter(|d| requested.contains(&d.id))
            .cloned()
            .collect();

        Self {
            mac: identity.as_str().to_string(),
            ecus,
        }
    }

    /// Identifiers of the devices carried by this request
    pub fn device_ids(&self) -> Vec<u32> {
        self.ecus.iter().map(|d| d.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn device(id: u32, make: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id,
            device_type: "Engine".into(),
            year: "2019".into(),
            make: make.into(),
            model: "X15".into(),
        }
    }

    #[test]
    fn test_descriptor_json_field_names() {
        let value = serde_json::to_value(device(7, "Cummins")).unwrap();
        assert_eq!(
            value,
            json!({"ID": 7, "type": "Engine", "year": "2019", "make": "Cummins", "model": "X15"})
        );
    }

    #[test]
    fn test_session_request_keeps_server_order() {
        let available = vec![device(1, "A"), device(2, "B"), device(3, "C")];
        let identity = Identity::new("aa:bb");

        let request = SessionRequest::new(&identity, &[3, 1], &available);

        assert_eq!(request.device_ids(), vec![1, 3]);
        assert_eq!(request.mac, "aa:bb");
    }

    #[test]
    fn test_session_request_ignores_unknown_ids() {
        let available = vec![device(1, "A"), device(2, "B")];
        let request = SessionRequest::new(&Identity::new("m"), &[2, 9], &available);

        assert_eq!(request.ecus, vec![device(2, "B")]);
    }

    #[test]
    fn test_session_request_body_shape() {
        let available = vec![device(1, "A"), device(2, "B")];
        let request = SessionRequest::new(&Identity::new("m"), &[2], &available);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "MAC": "m",
                "ECUs": [{"ID": 2, "type": "Engine", "year": "2019", "make": "B", "model": "X15"}]
            })
        );
    }

    #[test]
    fn test_registration_body() {
        let identity = Identity::new("00:0C:29:DE:AD:BE");
        let body = serde_json::to_string(&RegistrationBody::new(&identity)).unwrap();
        assert_eq!(body, r#"{"MAC":"00:0C:29:DE:AD:BE"}"#);
    }
}
