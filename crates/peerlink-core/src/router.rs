//! Connection-scoped message router.
//!
//! One `Router` exists per connection. It starts `Uninitialized` and accepts
//! nothing but the peer's negotiation message; once the peer's protocol table
//! arrives the remote proxies are built and the router becomes `Ready`. There
//! is no way back: a reconnect gets a fresh router.
//!
//! In the `Ready` state every inbound message is classified:
//!
//! - responses resolve the matching pending call (unknown ids are logged and dropped,
//!   a malformed body for a live id rejects that call with a parse error)
//! - requests are dispatched to the local target and always answered exactly once
//! - anything else is answered with a parse error when an id can be recovered
//!
//! Closing or dropping the router fails every call still waiting for a response.

use crate::codec::{
    self, classify, decode_negotiation, decode_request, decode_response, extract_id,
    MessageKind, Negotiation, Request, Response, RpcError,
};
use crate::config::RouterConfig;
use crate::error::{ErrorCode, PeerlinkError, Result};
use crate::introspect::resolve_args;
use crate::ledger::PendingCalls;
use crate::protocol::ProtocolTable;
use crate::remote::{PendingCallHandle, Remote};
use crate::sink::MessageSink;
use crate::target::RpcTarget;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Negotiation lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Negotiating,
    Ready,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Ready => "ready",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection RPC state: target, ledger, negotiated proxies.
pub struct Router<T: RpcTarget> {
    target: T,
    local_protocol: ProtocolTable,
    remote: Option<Remote>,
    ledger: PendingCalls,
    sink: Arc<dyn MessageSink>,
    config: RouterConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: RpcTarget> Router<T> {
    /// Create a router for a freshly opened channel.
    ///
    /// Fails if the target's signatures do not form a valid protocol table.
    pub fn new<K>(target: T, sink: K) -> Result<Self>
    where
        K: MessageSink + 'static,
    {
        Self::with_config(target, sink, RouterConfig::default())
    }

    pub fn with_config<K>(target: T, sink: K, config: RouterConfig) -> Result<Self>
    where
        K: MessageSink + 'static,
    {
        let local_protocol = target.protocol()?;
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);

        debug!(
            "Router created exposing {} procedures",
            local_protocol.len()
        );

        Ok(Self {
            target,
            local_protocol,
            remote: None,
            ledger: PendingCalls::new(config.max_pending_calls),
            sink: Arc::new(sink),
            config,
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Watch the connection state; `Ready` signals negotiation completed.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The table this side publishes.
    pub fn local_protocol(&self) -> &ProtocolTable {
        &self.local_protocol
    }

    /// Proxies for the peer's procedures, once negotiated.
    pub fn remote(&self) -> Option<&Remote> {
        self.remote.as_ref()
    }

    pub fn pending_calls(&self) -> &PendingCalls {
        &self.ledger
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Publish the local protocol table to the peer.
    pub fn announce(&self) -> Result<()> {
        info!(
            "Announcing protocol with {} procedures",
            self.local_protocol.len()
        );
        self.sink
            .send(Negotiation::new(self.local_protocol.clone()).into())
    }

    /// Call a remote procedure by name. Fails before negotiation completes.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<PendingCallHandle> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| PeerlinkError::NegotiationIncomplete {
                kind: format!("outbound {}", method),
            })?;
        remote.call(method, args)
    }

    /// Handle one inbound message.
    ///
    /// Errors are returned only for messages that could not be answered on
    /// the wire: anything before negotiation, a malformed negotiation, or a
    /// failed send. Dispatch failures are answered to the peer instead.
    pub fn handle_message(&mut self, msg: Value) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => {}
            _ if codec::is_negotiation(&msg) => return self.negotiate(msg),
            state => {
                let kind = describe(&msg);
                warn!(
                    "Received a {} message while {}, but protocol negotiation is not complete",
                    kind, state
                );
                return Err(PeerlinkError::NegotiationIncomplete { kind });
            }
        }

        if codec::is_negotiation(&msg) {
            warn!("Ignoring repeated protocol negotiation");
            return Ok(());
        }

        match classify(&msg) {
            MessageKind::Response => {
                self.handle_response(msg);
                Ok(())
            }
            MessageKind::Request => self.handle_request(msg),
            MessageKind::Unrecognized => self.handle_unrecognized(msg),
        }
    }

    /// Fail pending calls older than `max_age`.
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let reaped = self.ledger.reap_older_than(
            max_age,
            RpcError::new(
                ErrorCode::ServerError,
                format!("call timed out after {:?}", max_age),
            ),
        );
        if reaped > 0 {
            warn!("Reaped {} stale calls", reaped);
        }
        reaped
    }

    /// Tear down the connection, failing every outstanding call.
    pub fn close(self) {
        // Drop does the work.
    }

    fn negotiate(&mut self, msg: Value) -> Result<()> {
        self.state_tx.send_replace(ConnectionState::Negotiating);

        let negotiation = match decode_negotiation(msg) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                error!("Protocol negotiation failed: {}", e);
                self.state_tx.send_replace(ConnectionState::Uninitialized);
                return Err(e);
            }
        };

        let table = negotiation.data;
        info!(
            "Protocol negotiated: peer exposes [{}]",
            table.names().collect::<Vec<_>>().join(", ")
        );

        self.remote = Some(Remote::new(
            table,
            self.sink.clone(),
            self.ledger.clone(),
            &self.config,
        ));
        self.state_tx.send_replace(ConnectionState::Ready);
        Ok(())
    }

    fn handle_response(&self, msg: Value) {
        let id = extract_id(&msg);
        let response = match decode_response(msg) {
            Ok(response) => response,
            Err(e) => {
                // a live call still gets exactly one outcome
                match id.filter(|id| self.ledger.fail(id, e.to_rpc_error())) {
                    Some(id) => warn!("Rejected call {} with malformed response: {}", id, e),
                    None => warn!("Dropping response: {}", e),
                }
                return;
            }
        };

        let id = response.id.clone();
        if !self.ledger.resolve(response) {
            warn!("Couldn't find callback for message id: {}", id);
        }
    }

    fn handle_request(&mut self, msg: Value) -> Result<()> {
        let request = match decode_request(msg.clone()) {
            Ok(request) => request,
            Err(e) => {
                return match extract_id(&msg) {
                    Some(id) => self.reply(Response::failure(id, e.to_rpc_error())),
                    None => {
                        warn!("Dropping request without usable id: {}", e);
                        Ok(())
                    }
                };
            }
        };

        debug!("RPC call: {}({:?})", request.method, request.params);

        let response = match self.dispatch(&request) {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                warn!("RPC error for {}: {}", request.method, e);
                Response::failure(request.id, e.to_rpc_error())
            }
        };
        self.reply(response)
    }

    fn dispatch(&mut self, request: &Request) -> Result<Value> {
        let method = request.method.as_str();
        if !self.target.has_method(method) {
            return Err(PeerlinkError::MethodNotFound {
                method: method.to_string(),
            });
        }

        let meta = self
            .target
            .signatures()
            .iter()
            .find(|s| s.name() == method)
            .map(|s| s.arg_meta());
        let args = resolve_args(method, meta, &request.params)?;

        let target = &mut self.target;
        match catch_unwind(AssertUnwindSafe(|| target.invoke(method, args))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "method panicked".to_string());
                error!("{} panicked: {}", method, message);
                Err(PeerlinkError::server(message))
            }
        }
    }

    fn handle_unrecognized(&self, msg: Value) -> Result<()> {
        let error = PeerlinkError::Parse {
            message: "Could not parse message".to_string(),
        };
        match extract_id(&msg) {
            Some(id) => {
                warn!("Unrecognized message with id {}", id);
                self.reply(Response::failure(id, error.to_rpc_error()))
            }
            None => {
                warn!("Dropping unrecognized message: {}", msg);
                Ok(())
            }
        }
    }

    fn reply(&self, response: Response) -> Result<()> {
        self.sink.send(response.into())
    }
}

impl<T: RpcTarget> Drop for Router<T> {
    fn drop(&mut self) {
        let failed = self.ledger.fail_all(RpcError::new(
            ErrorCode::InternalError,
            PeerlinkError::ConnectionClosed.to_string(),
        ));
        if failed > 0 {
            info!("Connection closed with {} calls still pending", failed);
        }
    }
}

fn describe(msg: &Value) -> String {
    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        return method.to_string();
    }
    match classify(msg) {
        MessageKind::Response => "response".to_string(),
        MessageKind::Request => "request".to_string(),
        MessageKind::Unrecognized => "unrecognized".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, Param};
    use crate::introspect::{CallArgs, MethodSignature};
    use crate::ledger::CallState;
    use crate::target::MethodRegistry;
    use serde_json::json;
    use std::sync::Mutex;

    type Outbox = Arc<Mutex<Vec<Message>>>;

    fn map_target() -> MethodRegistry<Vec<f64>> {
        MethodRegistry::new(Vec::new())
            .method(MethodSignature::declare("set_center", "x, y, z"), |center, args| {
                *center = vec![args.get("x")?, args.get("y")?, args.get("z")?];
                Ok(json!(center))
            })
            .method(MethodSignature::declare("zoom", "level=4"), |_, args| {
                Ok(json!(args.get::<i64>("level")?))
            })
            .method(MethodSignature::declare("explode", ""), |_, _| {
                Err(PeerlinkError::server("renderer unavailable"))
            })
            .method(MethodSignature::declare("crash", ""), |_, _| {
                panic!("boom");
            })
    }

    fn router() -> (Router<MethodRegistry<Vec<f64>>>, Outbox) {
        let outbox = Outbox::default();
        let log = outbox.clone();
        let sink = move |m: Message| -> Result<()> {
            log.lock().unwrap().push(m);
            Ok(())
        };
        (Router::new(map_target(), sink).unwrap(), outbox)
    }

    fn peer_table() -> Value {
        json!({
            "method": "set_protocol",
            "data": [{
                "procedure": "add_annotation",
                "required": [{"key": "ann_type", "default": false}],
                "optional": [{"key": "meta", "default": {}}]
            }]
        })
    }

    fn ready_router() -> (Router<MethodRegistry<Vec<f64>>>, Outbox) {
        let (mut router, outbox) = router();
        router.handle_message(peer_table()).unwrap();
        (router, outbox)
    }

    fn last_response(outbox: &Outbox) -> Response {
        match outbox.lock().unwrap().last() {
            Some(Message::Response(resp)) => resp.clone(),
            other => panic!("Expected response, got: {:?}", other),
        }
    }

    fn request(method: &str, params: Value, id: &str) -> Value {
        json!({"method": method, "params": params, "jsonrpc": "2.0", "id": id})
    }

    #[test]
    fn test_rejects_traffic_before_negotiation() {
        let (mut router, outbox) = router();
        let err = router
            .handle_message(request("set_center", json!([]), "1"))
            .unwrap_err();

        assert!(matches!(err, PeerlinkError::NegotiationIncomplete { .. }));
        assert_eq!(err.to_rpc_error_code(), -32603);
        assert_eq!(router.state(), ConnectionState::Uninitialized);
        assert!(outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_negotiation_builds_remote() {
        let (mut router, _) = router();
        let mut state_rx = router.subscribe();
        assert!(router.remote().is_none());
        assert!(router.call("add_annotation", vec![json!("point")]).is_err());

        router.handle_message(peer_table()).unwrap();

        assert_eq!(router.state(), ConnectionState::Ready);
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Ready);
        assert!(router.remote().unwrap().contains("add_annotation"));
    }

    #[test]
    fn test_malformed_negotiation_stays_uninitialized() {
        let (mut router, _) = router();
        let err = router
            .handle_message(json!({"method": "set_protocol", "data": "nope"}))
            .unwrap_err();
        assert!(matches!(err, PeerlinkError::Parse { .. }));
        assert_eq!(router.state(), ConnectionState::Uninitialized);
    }

    #[test]
    fn test_repeated_negotiation_ignored() {
        let (mut router, _) = ready_router();
        router
            .handle_message(json!({"method": "set_protocol", "data": []}))
            .unwrap();
        assert!(router.remote().unwrap().contains("add_annotation"));
    }

    #[test]
    fn test_announce_sends_local_table() {
        let (router, outbox) = router();
        router.announce().unwrap();

        let sent = outbox.lock().unwrap()[0].to_value().unwrap();
        assert_eq!(sent["method"], json!("set_protocol"));
        let names: Vec<_> = sent["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["procedure"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["set_center", "zoom", "explode", "crash"]);
    }

    #[test]
    fn test_dispatch_success() {
        let (mut router, outbox) = ready_router();
        router
            .handle_message(request(
                "set_center",
                json!([
                    {"key": "z", "value": 3, "required": true},
                    {"key": "x", "value": 1, "required": true},
                    {"key": "y", "value": 2, "required": true}
                ]),
                "abc",
            ))
            .unwrap();

        let response = last_response(&outbox);
        assert_eq!(response.id.as_str(), Some("abc"));
        assert_eq!(response.result, json!([1.0, 2.0, 3.0]));
        assert!(response.error.is_none());
        assert_eq!(router.target().state(), &vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dispatch_applies_default() {
        let (mut router, outbox) = ready_router();
        router.handle_message(request("zoom", json!([]), "z1")).unwrap();
        assert_eq!(last_response(&outbox).result, json!(4));
    }

    #[test]
    fn test_method_not_found() {
        let (mut router, outbox) = ready_router();
        router.handle_message(request("fly_to", json!([]), "m1")).unwrap();

        assert_eq!(outbox.lock().unwrap().len(), 1);
        let response = last_response(&outbox);
        assert_eq!(response.id.as_str(), Some("m1"));
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn test_missing_required_param() {
        let (mut router, outbox) = ready_router();
        router
            .handle_message(request(
                "set_center",
                json!([{"key": "x", "value": 1, "required": true}]),
                "p1",
            ))
            .unwrap();
        assert_eq!(last_response(&outbox).error.unwrap().code, -32602);
    }

    #[test]
    fn test_method_error_is_answered() {
        let (mut router, outbox) = ready_router();
        router.handle_message(request("explode", json!([]), "e1")).unwrap();
        let error = last_response(&outbox).error.unwrap();
        assert_eq!(error.code, -32000);
        assert!(error.message.contains("renderer unavailable"));
    }

    #[test]
    fn test_method_panic_is_answered() {
        let (mut router, outbox) = ready_router();
        router.handle_message(request("crash", json!([]), "c1")).unwrap();
        let response = last_response(&outbox);
        assert_eq!(response.id.as_str(), Some("c1"));
        assert_eq!(response.error.unwrap().code, -32000);
    }

    #[test]
    fn test_method_without_metadata_is_parse_error() {
        struct Bare;
        impl RpcTarget for Bare {
            fn signatures(&self) -> &[MethodSignature] {
                &[]
            }
            fn has_method(&self, method: &str) -> bool {
                method == "debug"
            }
            fn invoke(&mut self, _: &str, _: CallArgs) -> Result<Value> {
                Ok(Value::Null)
            }
        }

        let outbox = Outbox::default();
        let log = outbox.clone();
        let sink = move |m: Message| -> Result<()> {
            log.lock().unwrap().push(m);
            Ok(())
        };
        let mut router = Router::new(Bare, sink).unwrap();
        router.handle_message(peer_table()).unwrap();
        router.handle_message(request("debug", json!([]), "d1")).unwrap();

        assert_eq!(last_response(&outbox).error.unwrap().code, -32700);
    }

    #[test]
    fn test_malformed_request_is_invalid_request() {
        let (mut router, outbox) = ready_router();
        router
            .handle_message(json!({"method": 5, "params": [], "id": "bad"}))
            .unwrap();
        let response = last_response(&outbox);
        assert_eq!(response.id.as_str(), Some("bad"));
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[test]
    fn test_unrecognized_with_id_gets_parse_error() {
        let (mut router, outbox) = ready_router();
        router.handle_message(json!({"id": "g1", "junk": true})).unwrap();
        let response = last_response(&outbox);
        assert_eq!(response.id.as_str(), Some("g1"));
        assert_eq!(response.error.unwrap().code, -32700);
    }

    #[test]
    fn test_unrecognized_without_id_is_only_logged() {
        let (mut router, outbox) = ready_router();
        router.handle_message(json!(["junk"])).unwrap();
        assert!(outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let (mut router, _) = ready_router();
        let handle = router.call("add_annotation", vec![json!("point")]).unwrap();
        let id = handle.id().clone();
        handle.then(|_| {}, |_| {}).unwrap();

        router
            .handle_message(json!({"result": 1, "error": null, "id": "nobody"}))
            .unwrap();

        assert_eq!(router.pending_calls().len(), 1);
        assert_eq!(router.pending_calls().state(&id), Some(CallState::Pending));
    }

    #[test]
    fn test_response_resolves_once() {
        let (mut router, outbox) = ready_router();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        router
            .call("add_annotation", vec![json!("point"), json!({"meta": {"a": 1}})])
            .unwrap()
            .then(move |v| sink.lock().unwrap().push(v), |_| {})
            .unwrap();

        let sent = match &outbox.lock().unwrap()[0] {
            Message::Request(req) => req.clone(),
            other => panic!("Expected request, got: {:?}", other),
        };
        assert_eq!(
            sent.params,
            vec![
                Param::required("ann_type", json!("point")),
                Param::optional("meta", json!({"a": 1})),
            ]
        );

        let response = json!({"result": "ok", "error": null, "id": sent.id});
        router.handle_message(response.clone()).unwrap();
        router.handle_message(response).unwrap();

        assert_eq!(*results.lock().unwrap(), vec![json!("ok")]);
        assert!(router.pending_calls().is_empty());
    }

    #[test]
    fn test_malformed_response_rejects_live_call() {
        let (mut router, outbox) = ready_router();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        router
            .call("add_annotation", vec![json!("point")])
            .unwrap()
            .then(|_| panic!("unexpected success"), move |e| sink.lock().unwrap().push(e))
            .unwrap();
        let id = match &outbox.lock().unwrap()[0] {
            Message::Request(req) => req.id.clone(),
            other => panic!("Expected request, got: {:?}", other),
        };

        router
            .handle_message(json!({"result": null, "error": "Method not found!", "id": id}))
            .unwrap();

        assert!(router.pending_calls().is_empty());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, -32700);
    }

    #[test]
    fn test_malformed_response_for_unknown_id_is_dropped() {
        let (mut router, _) = ready_router();
        router
            .call("add_annotation", vec![json!("point")])
            .unwrap()
            .then(|_| {}, |_| {})
            .unwrap();

        router
            .handle_message(json!({"result": null, "error": "oops", "id": "nobody"}))
            .unwrap();
        assert_eq!(router.pending_calls().len(), 1);
    }

    #[test]
    fn test_numeric_request_id_is_answered() {
        let (mut router, outbox) = ready_router();
        router
            .handle_message(json!({"method": "zoom", "params": [], "jsonrpc": "2.0", "id": 7}))
            .unwrap();
        router
            .handle_message(json!({"method": "ping", "params": [], "jsonrpc": "2.0", "id": 8}))
            .unwrap();

        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.len(), 2);
        let answered = outbox[0].to_value().unwrap();
        assert_eq!(answered["id"], json!(7));
        assert_eq!(answered["result"], json!(4));
        let missing = outbox[1].to_value().unwrap();
        assert_eq!(missing["id"], json!(8));
        assert_eq!(missing["error"]["code"], json!(-32601));
    }

    #[test]
    fn test_close_fails_pending_calls() {
        let (router, _) = ready_router();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        router
            .call("add_annotation", vec![json!("point")])
            .unwrap()
            .then(|_| {}, move |e| sink.lock().unwrap().push(e))
            .unwrap();

        router.close();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, -32603);
    }

    #[test]
    fn test_reap_stale() {
        let (router, _) = ready_router();
        router
            .call("add_annotation", vec![json!("point")])
            .unwrap()
            .then(|_| {}, |_| {})
            .unwrap();

        assert_eq!(router.reap_stale(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(router.reap_stale(Duration::ZERO), 1);
        assert!(router.pending_calls().is_empty());
    }
}
