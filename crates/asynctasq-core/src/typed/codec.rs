//! JSON payload codec.
//!
//! The default wire encoding for call arguments. JSON keeps payloads
//! self-describing and debuggable; swapping in a binary codec is a matter
//! of implementing `Serializer` and handing it to the builder.

use crate::ports::serializer::{CallArgs, CodecError, Serializer};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, call: &CallArgs) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(call).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CallArgs, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn format(&self) -> &'static str {
        "json"
    }
}
