//! JSON wire frames.
//!
//! Every WebSocket text message carries exactly one frame, in one of three
//! disjoint shapes:
//!
//! - [`Request`]: `{"id": 0, "method": "player.play", "params": [...]}`
//! - [`Response`]: `{"id": 0, "result": ..., "error": null}`
//! - [`Broadcast`]: `{"event": "player.state", "params": [...]}`
//!
//! # Example
//!
//! ```
//! use butler_bus::protocol::{Frame, Request};
//! use serde_json::json;
//!
//! let text = Frame::Request(Request::new(7, "echo", json!(["hi"]))).encode().unwrap();
//! match Frame::decode(&text).unwrap() {
//!     Frame::Request(req) => assert_eq!(req.id, 7),
//!     other => panic!("unexpected frame: {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ButlerError, Result};

/// Outbound call from caller to callee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Dot-separated method name.
    pub method: String,
    /// Positional (array) or named (object) parameters.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

impl Request {
    /// Create a new request.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Convert the params into positional arguments.
    ///
    /// Arrays spread into one argument per element, `null` yields none, and
    /// an object (or any other value) becomes a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self.params {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

/// Error object carried by a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Human-readable message.
    pub message: String,
}

/// Answer to a [`Request`]; exactly one of `result`/`error` is non-null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    /// Result value (`null` on failure).
    #[serde(default)]
    pub result: Value,
    /// Error (`null` on success).
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Build a successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Build a failed response.
    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(ErrorObject {
                message: message.into(),
            }),
        }
    }

    /// Check if this response carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Settle into a result. A non-null error wins; `result` is then ignored.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(ButlerError::Remote(error.message)),
            None => Ok(self.result),
        }
    }
}

/// Event published to every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Full event name.
    pub event: String,
    /// Positional arguments.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Broadcast {
    /// Create a new broadcast.
    pub fn new(event: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            params,
        }
    }
}

/// Any frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    /// Request frame.
    Request(Request),
    /// Response frame.
    Response(Response),
    /// Broadcast frame.
    Broadcast(Broadcast),
}

impl Frame {
    /// Parse one text message.
    ///
    /// A message with an `event` field is a broadcast, one with a `method`
    /// field is a request, and anything else must be a response.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Some(fields) = value.as_object() else {
            return Err(ButlerError::Protocol(format!(
                "expected a JSON object, got: {}",
                truncate(text)
            )));
        };

        let is_broadcast = fields.get("event").is_some_and(|e| !e.is_null());
        let is_request = fields.contains_key("method");
        let is_response = fields.contains_key("id");

        let frame = if is_broadcast {
            Frame::Broadcast(serde_json::from_value(value)?)
        } else if is_request {
            Frame::Request(serde_json::from_value(value)?)
        } else if is_response {
            Frame::Response(serde_json::from_value(value)?)
        } else {
            return Err(ButlerError::Protocol(format!(
                "unrecognized frame: {}",
                truncate(text)
            )));
        };

        Ok(frame)
    }

    /// Serialize to a text message.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Frame::Request(request)
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Frame::Response(response)
    }
}

impl From<Broadcast> for Frame {
    fn from(broadcast: Broadcast) -> Self {
        Frame::Broadcast(broadcast)
    }
}

/// Shorten a frame for error messages.
fn truncate(text: &str) -> &str {
    const MAX: usize = 128;
    match text.char_indices().nth(MAX) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
