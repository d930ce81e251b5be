//! Payload codec seam.
//!
//! The core never parses payloads itself. Requests are handed to a [`Codec`]
//! for encoding and every reply body goes through it for decoding.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::{RequestEnvelope, ResponseEnvelope, Result, RpcError};

/// Encodes request envelopes and decodes worker replies.
pub trait Codec: Send + Sync {
    fn encode(&self, request: RequestEnvelope) -> Result<Bytes>;

    /// Parse and validate a reply body. Malformed input yields `RpcError::Decode`.
    fn decode(&self, bytes: &[u8]) -> Result<ResponseEnvelope>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// JSON codec: requests become a flat JSON object, replies must be one.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, request: RequestEnvelope) -> Result<Bytes> {
        // ---
        let body = Value::Object(request.into_body());
        let bytes = serde_json::to_vec(&body).map_err(|e| RpcError::Encode(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8]) -> Result<ResponseEnvelope> {
        // ---
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(RpcError::Decode(format!(
                "reply must be a JSON object, got {}",
                json_kind(&value)
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
