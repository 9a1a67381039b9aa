//! Wire protocol shared by both ends of the bridge.
//!
//! Three message kinds travel over the channel: a correlated `call`, its
//! matching `response`, and an uncorrelated `keepalive`. This module is the
//! only place that has to agree byte-for-byte with the extension side, so
//! encoding and decoding are written out explicitly rather than derived —
//! unknown extra fields must be tolerated, and the result/error exclusivity
//! on responses has to be checked, neither of which a derive expresses well.

use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Outcome carried by a response frame: exactly one of a result value or an
/// error string.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success(Value),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// A named operation invocation, correlated by `id`.
    Call {
        id: String,
        operation: String,
        arguments: Value,
    },
    /// The answer to a previously sent call with the same `id`.
    Response { id: String, outcome: CallOutcome },
    /// Keeps the idle channel (and the extension's service worker) alive.
    /// Carries no id and is never correlated.
    Keepalive,
}

impl WireMessage {
    /// Serialize to the wire text representation.
    pub fn encode(&self) -> String {
        let value = match self {
            WireMessage::Call {
                id,
                operation,
                arguments,
            } => json!({
                "kind": "call",
                "id": id,
                "operation": operation,
                "arguments": arguments,
            }),
            WireMessage::Response { id, outcome } => match outcome {
                CallOutcome::Success(result) => json!({
                    "kind": "response",
                    "id": id,
                    "result": result,
                }),
                CallOutcome::Failure(error) => json!({
                    "kind": "response",
                    "id": id,
                    "error": error,
                }),
            },
            WireMessage::Keepalive => json!({ "kind": "keepalive" }),
        };
        value.to_string()
    }

    /// Parse a wire frame. Extra unknown fields are ignored so that newer
    /// peers can add fields without breaking older ones; structural problems
    /// (missing discriminant, missing id, a response carrying both result and
    /// error, an id on a keepalive) are protocol errors the caller is
    /// expected to log and drop.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid JSON frame: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Protocol("frame is not a JSON object".to_string()))?;

        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("frame has no 'kind' discriminant".to_string()))?;

        match kind {
            "call" => {
                let id = require_string(obj, "id", "call")?;
                let operation = require_string(obj, "operation", "call")?;
                // A call without arguments is treated as an empty object.
                let arguments = obj.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Ok(WireMessage::Call {
                    id,
                    operation,
                    arguments,
                })
            }
            "response" => {
                let id = require_string(obj, "id", "response")?;
                let result = obj.get("result");
                let error = obj.get("error");
                match (result, error) {
                    (Some(_), Some(_)) => Err(Error::Protocol(
                        "response carries both result and error".to_string(),
                    )),
                    (None, None) => Err(Error::Protocol(
                        "response carries neither result nor error".to_string(),
                    )),
                    (Some(result), None) => Ok(WireMessage::Response {
                        id,
                        outcome: CallOutcome::Success(result.clone()),
                    }),
                    (None, Some(error)) => {
                        let message = error.as_str().ok_or_else(|| {
                            Error::Protocol("response error is not a string".to_string())
                        })?;
                        Ok(WireMessage::Response {
                            id,
                            outcome: CallOutcome::Failure(message.to_string()),
                        })
                    }
                }
            }
            "keepalive" => {
                if obj.contains_key("id") {
                    return Err(Error::Protocol(
                        "keepalive must not carry an id".to_string(),
                    ));
                }
                Ok(WireMessage::Keepalive)
            }
            other => Err(Error::Protocol(format!("unknown message kind '{}'", other))),
        }
    }
}

fn require_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    kind: &str,
) -> Result<String> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Protocol(format!("{} frame has no string '{}'", kind, field)))
}
