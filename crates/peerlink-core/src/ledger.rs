//! Bookkeeping for outbound calls awaiting a response.
//!
//! Entries are keyed by correlation id and removed on the first resolution,
//! so a duplicate or late response for the same id finds nothing. Handlers
//! always run after the lock is released; a handler is free to issue new calls.

use crate::codec::{CorrelationId, Request, Response, RpcError};
use crate::error::{PeerlinkError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub type SuccessHandler = Box<dyn FnOnce(Value) + Send>;
pub type ErrorHandler = Box<dyn FnOnce(RpcError) + Send>;

/// Lifecycle of a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Registered but not yet sent.
    Created,
    /// Sent, handlers attached, waiting for the response.
    Pending,
}

struct PendingCall {
    request: Request,
    state: CallState,
    on_success: Option<SuccessHandler>,
    on_error: Option<ErrorHandler>,
    /// Registration time, restamped when the call is sent.
    since: Instant,
}

impl PendingCall {
    /// Run the matching handler. A panicking handler is logged and contained.
    fn complete(self, outcome: std::result::Result<Value, RpcError>) {
        let id = self.request.id;
        let run = AssertUnwindSafe(|| match outcome {
            Ok(result) => {
                if let Some(handler) = self.on_success {
                    handler(result);
                }
            }
            Err(error) => {
                if let Some(handler) = self.on_error {
                    handler(error);
                }
            }
        });
        if catch_unwind(run).is_err() {
            error!("Handler for call {} panicked", id);
        }
    }
}

/// Shared table of in-flight calls.
///
/// Cloning gives another handle to the same table.
#[derive(Clone)]
pub struct PendingCalls {
    entries: Arc<Mutex<HashMap<CorrelationId, PendingCall>>>,
    limit: usize,
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl PendingCalls {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        // Handlers never run under the lock, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new call in the `Created` state.
    pub fn register(&self, request: Request) -> Result<()> {
        let mut entries = self.lock();
        if entries.contains_key(&request.id) {
            return Err(PeerlinkError::invalid_request(format!(
                "correlation id {} is already in use",
                request.id
            )));
        }
        if entries.len() >= self.limit {
            return Err(PeerlinkError::TooManyPendingCalls { limit: self.limit });
        }
        entries.insert(
            request.id.clone(),
            PendingCall {
                request,
                state: CallState::Created,
                on_success: None,
                on_error: None,
                since: Instant::now(),
            },
        );
        Ok(())
    }

    /// Attach handlers and move the call to `Pending`.
    ///
    /// Returns the request that should now be sent.
    pub fn mark_pending(
        &self,
        id: &CorrelationId,
        on_success: SuccessHandler,
        on_error: ErrorHandler,
    ) -> Result<Request> {
        let mut entries = self.lock();
        let call = entries
            .get_mut(id)
            .ok_or_else(|| PeerlinkError::CallCancelled { id: id.clone() })?;
        if call.state == CallState::Pending {
            return Err(PeerlinkError::invalid_request(format!(
                "call {} was already sent",
                id
            )));
        }
        call.on_success = Some(on_success);
        call.on_error = Some(on_error);
        call.state = CallState::Pending;
        call.since = Instant::now();
        Ok(call.request.clone())
    }

    /// Resolve the call matching `response.id`.
    ///
    /// Returns `false` if no such call exists; nothing is changed in that case.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(call) = self.lock().remove(&response.id) else {
            return false;
        };
        debug!("Resolving call {} ({})", response.id, call.request.method);
        match response.error {
            Some(error) => call.complete(Err(error)),
            None => call.complete(Ok(response.result)),
        }
        true
    }

    /// Reject one call with `error`.
    pub fn fail(&self, id: &CorrelationId, error: RpcError) -> bool {
        let Some(call) = self.lock().remove(id) else {
            return false;
        };
        call.complete(Err(error));
        true
    }

    /// Drop a call without invoking any handler.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Reject every call. Returns how many were failed.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.complete(Err(error.clone()));
        }
        count
    }

    /// Reject calls sent (or, if unsent, registered) more than `max_age` ago.
    pub fn reap_older_than(&self, max_age: Duration, error: RpcError) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingCall> = {
            let mut entries = self.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, call)| now.duration_since(call.since) > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = expired.len();
        for call in expired {
            call.complete(Err(error.clone()));
        }
        count
    }

    pub fn state(&self, id: &CorrelationId) -> Option<CallState> {
        self.lock().get(id).map(|call| call.state)
    }

    /// The outbound request of a live call.
    pub fn request(&self, id: &CorrelationId) -> Option<Request> {
        self.lock().get(id).map(|call| call.request.clone())
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
