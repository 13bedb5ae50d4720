//! Centralized configuration for peerlink.
//!
//! Wire constants live on `ProtocolConfig`; per-connection tunables live on
//! `RouterConfig`, which can be built in code or read from the environment.

use std::time::Duration;
use tracing::warn;

/// Protocol-level constants shared by both peers.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    /// Method name of the one-time negotiation message.
    pub const NEGOTIATION_METHOD: &'static str = "set_protocol";
    /// Upper bound for a single serialized message accepted by hosts.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
}

/// Environment variables read by [`RouterConfig::from_env`].
pub struct EnvConfig;

impl EnvConfig {
    pub const CALL_TIMEOUT_MS: &'static str = "PEERLINK_CALL_TIMEOUT_MS";
    pub const MAX_PENDING: &'static str = "PEERLINK_MAX_PENDING";
}

/// Per-connection router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Timeout applied by `Reply::wait`. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Maximum number of calls allowed in the ledger at once.
    pub max_pending_calls: usize,
}

impl RouterConfig {
    pub const DEFAULT_MAX_PENDING_CALLS: usize = 8192;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default timeout for awaited calls.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the ledger capacity. Zero is treated as the default.
    pub fn with_max_pending_calls(mut self, limit: usize) -> Self {
        self.max_pending_calls = if limit == 0 {
            Self::DEFAULT_MAX_PENDING_CALLS
        } else {
            limit
        };
        self
    }

    /// Build a config from `PEERLINK_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = read_env_u64(EnvConfig::CALL_TIMEOUT_MS) {
            config.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(limit) = read_env_u64(EnvConfig::MAX_PENDING) {
            config = config.with_max_pending_calls(limit as usize);
        }

        config
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            max_pending_calls: Self::DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
