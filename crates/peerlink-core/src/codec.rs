//! Message construction and classification.
//!
//! Wire shapes:
//!
//! ```text
//! request:     {"method": m, "params": [{"key", "value", "required"}], "jsonrpc": "2.0", "id": id}
//! response:    {"result": r, "error": e, "id": id}          (exactly one of r/e non-null)
//! negotiation: {"method": "set_protocol", "data": [descriptor, ...]}
//! ```
//!
//! Classification looks at key presence only, so `{"result": null, "error": null, "id": x}`
//! is a response while a value missing any of the three keys is unrecognized.

use crate::config::ProtocolConfig;
use crate::error::{ErrorCode, PeerlinkError, Result};
use crate::protocol::ProtocolTable;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque token linking a request to its response.
///
/// Ids this side generates are v4 UUID strings. Ids the peer sends may be any
/// JSON string or number and are echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Str(String),
    Num(serde_json::Number),
}

impl CorrelationId {
    /// Generate a fresh v4 UUID id.
    pub fn new() -> Self {
        CorrelationId::Str(uuid::Uuid::new_v4().to_string())
    }

    /// The id as text, if it is a string id.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CorrelationId::Str(s) => Some(s),
            CorrelationId::Num(_) => None,
        }
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        CorrelationId::Str(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId::Str(value.to_string())
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        CorrelationId::Num(value.into())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationId::Str(s) => f.write_str(s),
            CorrelationId::Num(n) => write!(f, "{}", n),
        }
    }
}

/// One key-tagged argument of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub required: bool,
}

impl Param {
    pub fn required(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            required: true,
        }
    }

    pub fn optional(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            required: false,
        }
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub params: Vec<Param>,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: CorrelationId,
}

/// JSON-RPC response. `result` is `Value::Null` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<RpcError>,
    pub id: CorrelationId,
}

impl Response {
    pub fn success(id: CorrelationId, result: Value) -> Self {
        make_response(result, None, id)
    }

    pub fn failure(id: CorrelationId, error: RpcError) -> Self {
        make_response(Value::Null, Some(error), id)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The well-known code, if this is one of the standard ones.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSONRPCError ({}): {}", self.code, self.message)
    }
}

/// The one-time message carrying a peer's protocol table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    pub method: String,
    pub data: ProtocolTable,
}

impl Negotiation {
    pub fn new(table: ProtocolTable) -> Self {
        Self {
            method: ProtocolConfig::NEGOTIATION_METHOD.to_string(),
            data: table,
        }
    }
}

/// Any message this side puts on the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Negotiation(Negotiation),
}

impl Message {
    pub fn id(&self) -> Option<&CorrelationId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(resp) => Some(&resp.id),
            Message::Negotiation(_) => None,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Negotiation> for Message {
    fn from(value: Negotiation) -> Self {
        Message::Negotiation(value)
    }
}

/// Result of key-based classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Unrecognized,
}

/// Build a request with a freshly generated correlation id.
pub fn make_request(method: impl Into<String>, params: Vec<Param>) -> Result<Request> {
    let method = method.into();
    if method.is_empty() {
        return Err(PeerlinkError::invalid_request("method name must not be empty"));
    }
    Ok(Request {
        method,
        params,
        jsonrpc: default_version(),
        id: CorrelationId::new(),
    })
}

/// Build a response. Exactly one of `result`/`error` should carry a value;
/// this is not checked.
pub fn make_response(result: Value, error: Option<RpcError>, id: CorrelationId) -> Response {
    Response { result, error, id }
}

fn has_keys(msg: &Value, keys: &[&str]) -> bool {
    msg.as_object()
        .map(|obj| keys.iter().all(|k| obj.contains_key(*k)))
        .unwrap_or(false)
}

pub fn is_response(msg: &Value) -> bool {
    has_keys(msg, &["result", "error", "id"])
}

pub fn is_request(msg: &Value) -> bool {
    has_keys(msg, &["method", "params", "id"])
}

/// True for the negotiation message (`{"method": "set_protocol", "data": ...}`).
pub fn is_negotiation(msg: &Value) -> bool {
    msg.get("method").and_then(Value::as_str) == Some(ProtocolConfig::NEGOTIATION_METHOD)
        && has_keys(msg, &["data"])
}

pub fn classify(msg: &Value) -> MessageKind {
    if is_response(msg) {
        MessageKind::Response
    } else if is_request(msg) {
        MessageKind::Request
    } else {
        MessageKind::Unrecognized
    }
}

/// Recover a string or numeric id from an arbitrary value, if there is one.
pub fn extract_id(msg: &Value) -> Option<CorrelationId> {
    match msg.get("id")? {
        Value::String(s) => Some(CorrelationId::Str(s.clone())),
        Value::Number(n) => Some(CorrelationId::Num(n.clone())),
        _ => None,
    }
}

pub fn decode_request(msg: Value) -> Result<Request> {
    serde_json::from_value(msg).map_err(|e| PeerlinkError::InvalidRequest {
        message: format!("malformed request: {}", e),
    })
}

pub fn decode_response(msg: Value) -> Result<Response> {
    serde_json::from_value(msg).map_err(|e| PeerlinkError::Parse {
        message: format!("malformed response: {}", e),
    })
}

pub fn decode_negotiation(msg: Value) -> Result<Negotiation> {
    serde_json::from_value(msg).map_err(|e| PeerlinkError::Parse {
        message: format!("malformed protocol table: {}", e),
    })
}

fn default_version() -> String {
    ProtocolConfig::JSONRPC_VERSION.to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Param>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Param>>::deserialize(deserializer)?.unwrap_or_default())
}
