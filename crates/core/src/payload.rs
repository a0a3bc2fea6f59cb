//! Opaque task payloads and results.
//!
//! The queue never looks inside a payload. Each handler decodes the value
//! into its own type and encodes its own result.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Handler-specific structured value, written once at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(JsonValue);

impl Payload {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn null() -> Self {
        Self(JsonValue::Null)
    }

    /// Serialize a typed value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> DomainResult<Self> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| DomainError::Payload(format!("encode failed: {e}")))
    }

    /// Deserialize the payload into a handler's own type.
    pub fn decode<T: DeserializeOwned>(&self) -> DomainResult<T> {
        T::deserialize(&self.0).map_err(|e| DomainError::Payload(format!("decode failed: {e}")))
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_json(self) -> JsonValue {
        self.0
    }
}

impl From<JsonValue> for Payload {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SendDigest {
        subscription_id: u64,
        email: String,
    }

    #[test]
    fn typed_payload_decodes_into_handler_type() {
        let payload = Payload::new(serde_json::json!({
            "subscription_id": 7,
            "email": "a@example.com"
        }));

        let digest: SendDigest = payload.decode().unwrap();
        assert_eq!(digest.subscription_id, 7);
        assert_eq!(digest.email, "a@example.com");
    }

    #[test]
    fn decode_reports_shape_mismatch() {
        let payload = Payload::new(serde_json::json!({"subscription_id": "seven"}));
        let err = payload.decode::<SendDigest>().unwrap_err();
        assert!(matches!(err, DomainError::Payload(_)));
    }

    #[test]
    fn payload_serializes_transparently() {
        let payload = Payload::new(serde_json::json!({"k": 1}));
        assert_eq!(serde_json::to_string(&payload).unwrap(), r#"{"k":1}"#);
    }
}
