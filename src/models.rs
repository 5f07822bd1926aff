//! Minimal request shapes for the proxied OpenAI-style endpoints.
//!
//! They only check what the gateway itself depends on (`model`, `stream`,
//! the basic message layout). The original JSON payload is what gets
//! forwarded; unknown fields pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};
use crate::router::Operation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the dispatcher needs to know about a validated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub model: String,
    pub stream: bool,
}

/// Parse a raw request body as JSON.
pub fn parse_payload(body: &[u8]) -> Result<Value> {
    if body.is_empty() {
        return Err(GatewayError::BadRequest("Request body is empty".into()));
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("Request body is not valid JSON: {e}")))
}

/// Check `payload` against the shape expected for `operation`.
/// Embeddings never stream.
pub fn summarize(operation: Operation, payload: &Value) -> Result<RequestSummary> {
    let invalid = |e: serde_json::Error| {
        GatewayError::BadRequest(format!("Invalid {operation} request: {e}"))
    };
    match operation {
        Operation::ChatCompletions => {
            let req = ChatCompletionRequest::deserialize(payload).map_err(invalid)?;
            Ok(RequestSummary {
                model: req.model,
                stream: req.stream.unwrap_or(false),
            })
        }
        Operation::Completions => {
            let req = CompletionRequest::deserialize(payload).map_err(invalid)?;
            Ok(RequestSummary {
                model: req.model,
                stream: req.stream.unwrap_or(false),
            })
        }
        Operation::Embeddings => {
            let req = EmbeddingRequest::deserialize(payload).map_err(invalid)?;
            Ok(RequestSummary {
                model: req.model,
                stream: false,
            })
        }
    }
}
