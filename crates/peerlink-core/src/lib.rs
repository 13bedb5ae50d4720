//! Peerlink - Symmetric JSON-RPC peer engine.
//!
//! Two peers share one bidirectional message channel. Each side publishes a
//! protocol table describing the procedures it exposes; once the other side's
//! table arrives, its procedures become callable through generated proxies and
//! inbound requests are dispatched to the local target.
//!
//! The crate does not own a transport. The host feeds inbound messages to
//! [`Router::handle_message`] and supplies a [`MessageSink`] for outbound ones.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerlink::{ChannelSink, MethodRegistry, MethodSignature, Router};
//! use serde_json::json;
//!
//! let target = MethodRegistry::new(MapState::default())
//!     .method(MethodSignature::declare("set_center", "x, y, z"), |map, args| {
//!         map.center = [args.get("x")?, args.get("y")?, args.get("z")?];
//!         Ok(json!(map.center))
//!     });
//!
//! let (sink, outbound) = ChannelSink::pair();
//! let mut router = Router::new(target, sink)?;
//! router.announce()?;
//!
//! // for every line read from the transport:
//! router.handle_message(serde_json::from_str(&line)?)?;
//!
//! // once negotiated:
//! let center = router.call("get_center", vec![])?.send()?.wait().await?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod introspect;
pub mod ledger;
pub mod protocol;
pub mod remote;
pub mod router;
pub mod sink;
pub mod target;

// Re-export commonly used types
pub use codec::{
    classify, extract_id, make_request, make_response, CorrelationId, Message, MessageKind,
    Negotiation, Param, Request, Response, RpcError,
};
pub use config::{EnvConfig, ProtocolConfig, RouterConfig};
pub use error::{ErrorCode, PeerlinkError, Result};
pub use introspect::{introspect, resolve_args, ArgMeta, CallArgs, MethodSignature};
pub use ledger::{CallState, PendingCalls};
pub use protocol::{OptionalParam, ProcedureDescriptor, ProtocolTable};
pub use remote::{PendingCallHandle, Remote, RemoteProcedure, Reply};
pub use router::{ConnectionState, Router};
pub use sink::{ChannelSink, MessageSink};
pub use target::{MethodRegistry, RpcTarget};
