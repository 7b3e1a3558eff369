//! The message envelope and its JSON wire codec.
//!
//! The same envelope travels on the external broker and on the internal bus,
//! so the codec must round-trip every field. `payload` is opaque bytes and is
//! carried as a base64 string on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::BridgeError;

/// API version stamped on envelopes created by the bridge.
pub const API_VERSION: &str = "v3";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// `errorCode` value of a successful response.
pub const ERROR_CODE_OK: i32 = 0;
/// `errorCode` value of an error response.
pub const ERROR_CODE_FAILED: i32 = 1;

/// Unit of exchange on both buses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub received_topic: String,
    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
    /// Kept as raw JSON values so that a non-flat mapping survives decoding
    /// and can be rejected by request validation instead.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "query_params_map")]
    pub query_params: BTreeMap<String, Value>,
}

impl MessageEnvelope {
    /// Decode an envelope received from either bus.
    ///
    /// A missing correlation ID is replaced with a fresh one so that every
    /// decoded envelope can be traced.
    pub fn from_json(bytes: &[u8]) -> Result<Self, BridgeError> {
        let mut envelope: MessageEnvelope =
            serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))?;
        if envelope.correlation_id.is_empty() {
            envelope.correlation_id = Uuid::new_v4().to_string();
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Encode(e.to_string()))
    }

    /// Build a successful response to `request`.
    pub fn new_response(
        request: &MessageEnvelope,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: request.correlation_id.clone(),
            request_id: request.request_id.clone(),
            error_code: ERROR_CODE_OK,
            payload,
            content_type: content_type.into(),
            query_params: BTreeMap::new(),
        }
    }

    /// Build an error response to `request` carrying `message` as payload.
    ///
    /// `requestID` and `correlationID` are echoed unchanged.
    pub fn with_error(request: &MessageEnvelope, message: impl Into<String>) -> Self {
        Self::error_for(&request.request_id, &request.correlation_id, message)
    }

    /// Build an error envelope when no request could be decoded.
    pub fn error_for(request_id: &str, correlation_id: &str, message: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: correlation_id.to_string(),
            request_id: request_id.to_string(),
            error_code: ERROR_CODE_FAILED,
            payload: message.into().into_bytes(),
            content_type: CONTENT_TYPE_TEXT.to_string(),
            query_params: BTreeMap::new(),
        }
    }

    /// The query parameter `name`, when present with a string value.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.error_code == ERROR_CODE_FAILED
    }

    /// The payload as text, for logging error messages.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// `null` decodes as no parameters; anything but an object is a decode error.
fn query_params_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        // `null` is accepted as an empty payload.
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
