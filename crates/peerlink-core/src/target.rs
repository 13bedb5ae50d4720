//! The local object whose methods the peer may call.

use crate::error::{PeerlinkError, Result};
use crate::introspect::{CallArgs, MethodSignature};
use crate::protocol::ProtocolTable;
use serde_json::Value;
use std::collections::HashMap;

/// Dispatch target registered with a router.
///
/// `signatures` is the whitelist published to the peer. `has_method` decides
/// whether a requested name exists at all; a method that exists without a
/// signature cannot have its arguments reconstructed and fails with a parse
/// error.
pub trait RpcTarget: Send {
    fn signatures(&self) -> &[MethodSignature];

    fn has_method(&self, method: &str) -> bool {
        self.signatures().iter().any(|s| s.name() == method)
    }

    fn invoke(&mut self, method: &str, args: CallArgs) -> Result<Value>;

    /// The protocol table describing this target.
    fn protocol(&self) -> Result<ProtocolTable> {
        ProtocolTable::from_signatures(self.signatures())
    }
}

type Handler<S> = Box<dyn FnMut(&mut S, CallArgs) -> Result<Value> + Send>;

/// A target built from a state value and a table of handlers.
///
/// ```rust,ignore
/// let target = MethodRegistry::new(MapState::default())
///     .method(MethodSignature::declare("set_center", "x, y, z"), |state, args| {
///         state.center = [args.get("x")?, args.get("y")?, args.get("z")?];
///         Ok(json!(state.center))
///     });
/// ```
pub struct MethodRegistry<S> {
    state: S,
    signatures: Vec<MethodSignature>,
    handlers: HashMap<String, Handler<S>>,
}

impl<S: Send> MethodRegistry<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            signatures: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A later registration with the same name replaces it.
    pub fn method<F>(mut self, signature: MethodSignature, handler: F) -> Self
    where
        F: FnMut(&mut S, CallArgs) -> Result<Value> + Send + 'static,
    {
        let name = signature.name().to_string();
        self.signatures.retain(|s| s.name() != name);
        self.signatures.push(signature);
        self.handlers.insert(name, Box::new(handler));
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }
}

impl<S: Send> RpcTarget for MethodRegistry<S> {
    fn signatures(&self) -> &[MethodSignature] {
        &self.signatures
    }

    fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    fn invoke(&mut self, method: &str, args: CallArgs) -> Result<Value> {
        let handler = self
            .handlers
            .get_mut(method)
            .ok_or_else(|| PeerlinkError::MethodNotFound {
                method: method.to_string(),
            })?;
        handler(&mut self.state, args)
    }
}
