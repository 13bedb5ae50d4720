//! Callable proxies for the peer's procedures.
//!
//! After negotiation every descriptor in the peer's protocol table gets a
//! [`RemoteProcedure`]. Calling one validates the arguments against the
//! descriptor, registers a pending call, and hands back a
//! [`PendingCallHandle`]; nothing is sent until the handle is used.
//!
//! ```rust,ignore
//! let remote = router.remote().expect("negotiated");
//! remote
//!     .call("set_center", vec![json!(-74.25), json!(40.0), json!(4)])?
//!     .then(|result| println!("{}", result), |error| eprintln!("{}", error))?;
//!
//! let state = remote.call("get_map_state", vec![])?.send()?.wait().await?;
//! ```

use crate::codec::{make_request, CorrelationId, Param, Request, RpcError};
use crate::config::RouterConfig;
use crate::error::{PeerlinkError, Result};
use crate::ledger::{CallState, PendingCalls};
use crate::protocol::{ProcedureDescriptor, ProtocolTable};
use crate::sink::MessageSink;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Proxy for a single remote procedure.
#[derive(Clone)]
pub struct RemoteProcedure {
    descriptor: ProcedureDescriptor,
    ledger: PendingCalls,
    sink: Arc<dyn MessageSink>,
    call_timeout: Option<Duration>,
}

impl RemoteProcedure {
    pub fn descriptor(&self) -> &ProcedureDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Tag positional arguments against the descriptor.
    ///
    /// Required arguments come first, in declaration order. One extra trailing
    /// argument is allowed and must be an object of optional arguments.
    pub fn build_params(&self, mut args: Vec<Value>) -> Result<Vec<Param>> {
        let name = &self.descriptor.name;
        let required = self.descriptor.required.len();

        if args.len() < required {
            return Err(PeerlinkError::invalid_request(format!(
                "Too few arguments passed to {}: expected {}, got {}",
                name,
                required,
                args.len()
            )));
        }
        if args.len() > required + 1 {
            return Err(PeerlinkError::invalid_request(format!(
                "Too many arguments passed to {}: expected at most {}, got {}",
                name,
                required + 1,
                args.len()
            )));
        }

        let optionals = if args.len() == required + 1 {
            match args.pop() {
                Some(Value::Object(map)) => map,
                other => {
                    return Err(PeerlinkError::invalid_request(format!(
                        "Optional arguments must be an object, received {} for procedure {}",
                        other.unwrap_or(Value::Null),
                        name
                    )))
                }
            }
        } else {
            serde_json::Map::new()
        };

        let mut params: Vec<Param> = self
            .descriptor
            .required
            .iter()
            .zip(args)
            .map(|(key, value)| Param::required(key.clone(), value))
            .collect();

        for (key, value) in optionals {
            if !self.descriptor.is_optional(&key) {
                debug!("{} does not declare optional {}, sending it anyway", name, key);
            }
            params.push(Param::optional(key, value));
        }

        Ok(params)
    }

    /// Build and register a call. The request is sent by the returned handle.
    pub fn call(&self, args: Vec<Value>) -> Result<PendingCallHandle> {
        let params = self.build_params(args)?;
        let request = make_request(self.descriptor.name.clone(), params)?;
        let id = request.id.clone();

        self.ledger.register(request)?;
        debug!("Registered call {} to {}", id, self.descriptor.name);

        Ok(PendingCallHandle {
            id,
            ledger: self.ledger.clone(),
            sink: self.sink.clone(),
            call_timeout: self.call_timeout,
        })
    }
}

/// Proxies for every procedure the peer published, looked up by name.
#[derive(Clone)]
pub struct Remote {
    table: ProtocolTable,
    procedures: Arc<HashMap<String, RemoteProcedure>>,
    ledger: PendingCalls,
}

impl Remote {
    pub fn new(
        table: ProtocolTable,
        sink: Arc<dyn MessageSink>,
        ledger: PendingCalls,
        config: &RouterConfig,
    ) -> Self {
        let procedures = table
            .iter()
            .map(|descriptor| {
                (
                    descriptor.name.clone(),
                    RemoteProcedure {
                        descriptor: descriptor.clone(),
                        ledger: ledger.clone(),
                        sink: sink.clone(),
                        call_timeout: config.call_timeout,
                    },
                )
            })
            .collect();

        Self {
            table,
            procedures: Arc::new(procedures),
            ledger,
        }
    }

    pub fn procedure(&self, name: &str) -> Result<&RemoteProcedure> {
        self.procedures
            .get(name)
            .ok_or_else(|| PeerlinkError::MethodNotFound {
                method: name.to_string(),
            })
    }

    /// Call a procedure by name. See [`RemoteProcedure::call`].
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<PendingCallHandle> {
        self.procedure(name)?.call(args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    pub fn pending_calls(&self) -> &PendingCalls {
        &self.ledger
    }
}

/// Handle to a registered call.
///
/// Dropping the handle without sending leaves the call registered until the
/// connection is torn down; use [`PendingCallHandle::cancel`] to discard it.
#[must_use = "a call is not sent until `then` or `send` is used"]
pub struct PendingCallHandle {
    id: CorrelationId,
    ledger: PendingCalls,
    sink: Arc<dyn MessageSink>,
    call_timeout: Option<Duration>,
}

impl PendingCallHandle {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn state(&self) -> Option<CallState> {
        self.ledger.state(&self.id)
    }

    /// The request this call will send.
    pub fn request(&self) -> Option<Request> {
        self.ledger.request(&self.id)
    }

    /// Attach handlers and send the request.
    ///
    /// If the send fails the call is removed from the ledger and the error
    /// is returned; neither handler runs.
    pub fn then<S, E>(self, on_success: S, on_error: E) -> Result<()>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(RpcError) + Send + 'static,
    {
        let request = self
            .ledger
            .mark_pending(&self.id, Box::new(on_success), Box::new(on_error))?;

        if let Err(e) = self.sink.send(request.into()) {
            warn!("Failed to send call {}: {}", self.id, e);
            self.ledger.cancel(&self.id);
            return Err(e);
        }
        Ok(())
    }

    /// Send the request and return an awaitable reply.
    pub fn send(self) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let tx_err = Arc::new(std::sync::Mutex::new(Some(tx)));
        let tx_ok = tx_err.clone();

        let id = self.id.clone();
        let ledger = self.ledger.clone();
        let timeout = self.call_timeout;

        self.then(
            move |result| {
                if let Some(tx) = tx_ok.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Ok(result));
                }
            },
            move |error| {
                if let Some(tx) = tx_err.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Err(error));
                }
            },
        )?;

        Ok(Reply {
            id,
            rx,
            ledger,
            timeout,
        })
    }

    /// Discard the call. Returns `false` if it had already completed.
    pub fn cancel(self) -> bool {
        self.ledger.cancel(&self.id)
    }
}

/// Awaitable outcome of a sent call.
pub struct Reply {
    id: CorrelationId,
    rx: oneshot::Receiver<std::result::Result<Value, RpcError>>,
    ledger: PendingCalls,
    timeout: Option<Duration>,
}

impl Reply {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait using the configured default timeout, if any.
    pub async fn wait(self) -> Result<Value> {
        match self.timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => Self::finish(self.id, self.rx.await),
        }
    }

    /// Wait at most `timeout`. On expiry the call is removed from the ledger.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(outcome) => Self::finish(self.id, outcome),
            Err(_) => {
                self.ledger.cancel(&self.id);
                Err(PeerlinkError::CallTimedOut {
                    id: self.id,
                    after: timeout,
                })
            }
        }
    }

    /// Stop waiting and drop the call from the ledger.
    pub fn cancel(self) -> bool {
        self.ledger.cancel(&self.id)
    }

    fn finish(
        id: CorrelationId,
        outcome: std::result::Result<std::result::Result<Value, RpcError>, oneshot::error::RecvError>,
    ) -> Result<Value> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(PeerlinkError::Remote(error)),
            // entry dropped without a handler call
            Err(_) => Err(PeerlinkError::CallCancelled { id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, Response};
    use crate::error::ErrorCode;
    use serde_json::json;
    use std::sync::Mutex;

    type Outbox = Arc<Mutex<Vec<Message>>>;

    fn remote_for(table: ProtocolTable, config: RouterConfig) -> (Remote, Outbox) {
        let outbox = Outbox::default();
        let log = outbox.clone();
        let sink: Arc<dyn MessageSink> = Arc::new(move |m: Message| -> Result<()> {
            log.lock().unwrap().push(m);
            Ok(())
        });
        let ledger = PendingCalls::new(config.max_pending_calls);
        (Remote::new(table, sink, ledger, &config), outbox)
    }

    fn map_table() -> ProtocolTable {
        ProtocolTable::new(vec![
            ProcedureDescriptor::new("set_center")
                .with_required("x")
                .with_required("y")
                .with_required("z"),
            ProcedureDescriptor::new("add_layer")
                .with_required("name")
                .with_optional("opacity", json!(1.0)),
        ])
        .unwrap()
    }

    fn sent_request(outbox: &Outbox, index: usize) -> Request {
        match &outbox.lock().unwrap()[index] {
            Message::Request(req) => req.clone(),
            other => panic!("Expected request, got: {:?}", other),
        }
    }

    #[test]
    fn test_call_registers_but_does_not_send() {
        let (remote, outbox) = remote_for(map_table(), RouterConfig::default());
        let handle = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap();

        assert_eq!(handle.state(), Some(CallState::Created));
        assert_eq!(remote.pending_calls().len(), 1);
        assert!(outbox.lock().unwrap().is_empty());

        let request = handle.request().unwrap();
        assert_eq!(request.method, "set_center");
        assert_eq!(
            request.params,
            vec![
                Param::required("x", json!(1)),
                Param::required("y", json!(2)),
                Param::required("z", json!(3)),
            ]
        );
    }

    #[test]
    fn test_then_sends_and_marks_pending() {
        let (remote, outbox) = remote_for(map_table(), RouterConfig::default());
        let handle = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap();
        let id = handle.id().clone();

        handle.then(|_| {}, |_| {}).unwrap();

        assert_eq!(remote.pending_calls().state(&id), Some(CallState::Pending));
        assert_eq!(sent_request(&outbox, 0).id, id);
    }

    #[test]
    fn test_too_few_arguments() {
        let (remote, outbox) = remote_for(map_table(), RouterConfig::default());
        let err = remote
            .call("set_center", vec![json!(1), json!(2)])
            .err()
            .unwrap();
        assert!(matches!(err, PeerlinkError::InvalidRequest { .. }));
        assert!(remote.pending_calls().is_empty());
        assert!(outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_too_many_arguments() {
        let (remote, _) = remote_for(map_table(), RouterConfig::default());
        let err = remote
            .call("add_layer", vec![json!("osm"), json!({}), json!(3)])
            .err()
            .unwrap();
        assert!(err.to_string().contains("Too many"));
    }

    #[test]
    fn test_trailing_argument_must_be_object() {
        let (remote, _) = remote_for(map_table(), RouterConfig::default());
        let err = remote
            .call("add_layer", vec![json!("osm"), json!(0.5)])
            .err()
            .unwrap();
        assert!(matches!(err, PeerlinkError::InvalidRequest { .. }));
    }

    #[test]
    fn test_optionals_are_tagged() {
        let (remote, _) = remote_for(map_table(), RouterConfig::default());
        let handle = remote
            .call("add_layer", vec![json!("osm"), json!({"opacity": 0.5})])
            .unwrap();
        assert_eq!(
            handle.request().unwrap().params,
            vec![
                Param::required("name", json!("osm")),
                Param::optional("opacity", json!(0.5)),
            ]
        );
    }

    #[test]
    fn test_unknown_procedure() {
        let (remote, _) = remote_for(map_table(), RouterConfig::default());
        assert!(matches!(
            remote.call("remove_layer", vec![]),
            Err(PeerlinkError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_failed_send_removes_call() {
        let config = RouterConfig::default();
        let sink: Arc<dyn MessageSink> = Arc::new(|_: Message| -> Result<()> {
            Err(PeerlinkError::Transport {
                message: "gone".into(),
            })
        });
        let ledger = PendingCalls::new(config.max_pending_calls);
        let remote = Remote::new(map_table(), sink, ledger, &config);

        let handle = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap();
        assert!(handle.then(|_| {}, |_| {}).is_err());
        assert!(remote.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reply_resolves() {
        let (remote, outbox) = remote_for(map_table(), RouterConfig::default());
        let reply = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap()
            .send()
            .unwrap();

        let id = sent_request(&outbox, 0).id;
        remote
            .pending_calls()
            .resolve(Response::success(id, json!([1, 2, 3])));

        assert_eq!(reply.wait().await.unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_reply_surfaces_remote_error() {
        let (remote, outbox) = remote_for(map_table(), RouterConfig::default());
        let reply = remote
            .call("add_layer", vec![json!("osm")])
            .unwrap()
            .send()
            .unwrap();

        let id = sent_request(&outbox, 0).id;
        remote.pending_calls().resolve(Response::failure(
            id,
            RpcError::new(ErrorCode::ServerError, "no such layer"),
        ));

        match reply.wait().await {
            Err(PeerlinkError::Remote(error)) => assert_eq!(error.code, -32000),
            other => panic!("Expected remote error, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout_cancels_call() {
        let config = RouterConfig::default().with_call_timeout(Some(Duration::from_millis(50)));
        let (remote, _) = remote_for(map_table(), config);
        let reply = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap()
            .send()
            .unwrap();

        let err = reply.wait().await.unwrap_err();
        assert!(matches!(err, PeerlinkError::CallTimedOut { .. }));
        assert!(remote.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reply_cancelled_when_entry_dropped() {
        let (remote, _) = remote_for(map_table(), RouterConfig::default());
        let reply = remote
            .call("set_center", vec![json!(1), json!(2), json!(3)])
            .unwrap()
            .send()
            .unwrap();
        let id = reply.id().clone();

        assert!(remote.pending_calls().cancel(&id));
        assert!(matches!(
            reply.wait().await,
            Err(PeerlinkError::CallCancelled { .. })
        ));
    }
}
