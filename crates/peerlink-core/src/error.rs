//! Error types for peerlink.
//!
//! `PeerlinkError` covers local failures (bad proxy arguments, transport
//! problems, timeouts) as well as dispatch failures that have to be reported
//! back to the peer. Every variant maps onto one of the JSON-RPC error codes
//! used on the wire, see [`PeerlinkError::to_rpc_error_code`].

use crate::codec::{CorrelationId, RpcError};
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes understood by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError,
}

impl ErrorCode {
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerError => -32000,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32000 => Some(ErrorCode::ServerError),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "ParseError",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::MethodNotFound => "MethodNotFound",
            ErrorCode::InvalidParams => "InvalidParams",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ServerError => "ServerError",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Main error type for peerlink.
#[derive(Debug, Error)]
pub enum PeerlinkError {
    // Protocol errors
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// A failure raised by a dispatched method.
    #[error("Server error: {message}")]
    Server {
        message: String,
        data: Option<serde_json::Value>,
    },

    // Connection lifecycle errors
    #[error("Negotiation not complete, dropping {kind} message")]
    NegotiationIncomplete { kind: String },

    #[error("Connection closed")]
    ConnectionClosed,

    // Call errors
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RpcError),

    #[error("Call {id} timed out after {after:?}")]
    CallTimedOut { id: CorrelationId, after: Duration },

    #[error("Call {id} was cancelled")]
    CallCancelled { id: CorrelationId },

    #[error("Too many pending calls (limit {limit})")]
    TooManyPendingCalls { limit: usize },

    // Transport and serialization errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for peerlink operations.
pub type Result<T> = std::result::Result<T, PeerlinkError>;

impl From<serde_json::Error> for PeerlinkError {
    fn from(err: serde_json::Error) -> Self {
        PeerlinkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PeerlinkError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        PeerlinkError::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        PeerlinkError::InvalidParams {
            message: message.into(),
        }
    }

    /// Error for a dispatched method that failed for its own reasons.
    pub fn server(message: impl Into<String>) -> Self {
        PeerlinkError::Server {
            message: message.into(),
            data: None,
        }
    }

    /// Classify this error into one of the wire error codes.
    ///
    /// - -32700: malformed or unclassifiable messages
    /// - -32600: bad call construction, duplicate ids
    /// - -32601: unknown method
    /// - -32602: missing or mistyped params
    /// - -32603: lifecycle and transport failures
    /// - -32000: failures raised by the invoked method
    pub fn code(&self) -> ErrorCode {
        match self {
            PeerlinkError::Parse { .. } | PeerlinkError::Json { .. } => ErrorCode::ParseError,

            PeerlinkError::InvalidRequest { .. } => ErrorCode::InvalidRequest,

            PeerlinkError::MethodNotFound { .. } => ErrorCode::MethodNotFound,

            PeerlinkError::InvalidParams { .. } => ErrorCode::InvalidParams,

            PeerlinkError::Server { .. }
            | PeerlinkError::TooManyPendingCalls { .. }
            | PeerlinkError::CallTimedOut { .. } => ErrorCode::ServerError,

            PeerlinkError::Remote(err) => {
                ErrorCode::from_code(err.code).unwrap_or(ErrorCode::ServerError)
            }

            PeerlinkError::Internal { .. }
            | PeerlinkError::NegotiationIncomplete { .. }
            | PeerlinkError::ConnectionClosed
            | PeerlinkError::CallCancelled { .. }
            | PeerlinkError::Transport { .. } => ErrorCode::InternalError,
        }
    }

    /// Convert to a numeric JSON-RPC error code.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            // Keep whatever the peer sent, even codes we don't know.
            PeerlinkError::Remote(err) => err.code,
            other => other.code().code(),
        }
    }

    /// Build the wire error object for this error.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            PeerlinkError::Remote(err) => err.clone(),
            PeerlinkError::Server {
                data: Some(data), ..
            } => RpcError::new(self.code(), self.to_string()).with_data(data.clone()),
            _ => RpcError::new(self.code(), self.to_string()),
        }
    }
}
