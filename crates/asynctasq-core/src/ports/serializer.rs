//! Serializer port - payload と呼び出し引数の相互変換。
//!
//! Producers encode `(args, kwargs)` into opaque bytes at enqueue; the
//! worker decodes them back before dispatch. The decoder must be
//! deterministic: the same bytes always produce the same call, so a
//! redelivered envelope runs the same invocation.

use serde::{Deserialize, Serialize};

/// Positional + keyword arguments of one task invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl CallArgs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<serde_json::Value>) -> Self {
        Self { args, kwargs: serde_json::Map::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload encode failed: {0}")]
    Encode(String),

    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Payload codec contract. The shipped implementation is JSON
/// (`typed::codec::JsonSerializer`); a binary codec drops in here without
/// touching the worker.
pub trait Serializer: Send + Sync {
    fn encode(&self, call: &CallArgs) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<CallArgs, CodecError>;

    /// Short content-type-ish label for headers and logs.
    fn format(&self) -> &'static str {
        "json"
    }
}
