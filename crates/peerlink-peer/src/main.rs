//! Peerlink Peer - JSON-RPC peer speaking newline-delimited JSON on stdio.
//!
//! Exposes a small map-view target to whoever is on the other end of
//! stdin/stdout. Logs go to stderr so stdout carries only wire messages.

mod demo;
mod host;

use anyhow::{Context, Result};
use clap::Parser;
use host::{HostOptions, OutboundCall};
use peerlink::RouterConfig;
use serde_json::Value;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "peerlink-peer")]
#[command(about = "JSON-RPC peer over newline-delimited stdio")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Default timeout for outbound calls, in milliseconds (0 = none)
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Maximum number of outbound calls awaiting a response
    #[arg(long)]
    max_pending: Option<usize>,

    /// Don't publish the local protocol table on startup
    #[arg(long)]
    no_announce: bool,

    /// Call this peer procedure once negotiated, then exit
    #[arg(long)]
    call: Option<String>,

    /// JSON array of positional arguments for --call
    #[arg(long, default_value = "[]")]
    args: String,
}

impl Args {
    fn router_config(&self) -> RouterConfig {
        let mut config = RouterConfig::from_env();
        if let Some(ms) = self.call_timeout_ms {
            config = config.with_call_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if let Some(limit) = self.max_pending {
            config = config.with_max_pending_calls(limit);
        }
        config
    }

    fn outbound_call(&self) -> Result<Option<OutboundCall>> {
        let Some(method) = &self.call else {
            return Ok(None);
        };
        let args: Vec<Value> =
            serde_json::from_str(&self.args).context("--args must be a JSON array")?;
        Ok(Some(OutboundCall {
            method: method.clone(),
            args,
        }))
    }
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting peerlink peer");

    let config = args.router_config();
    let options = HostOptions {
        announce: !args.no_announce,
        call: args.outbound_call()?,
        ..HostOptions::default()
    };
    let target = demo::map_target()?;

    info!(
        "Exposing {} procedures (call timeout: {:?}, max pending: {})",
        target.state().protocol.len(),
        config.call_timeout,
        config.max_pending_calls
    );

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    host::run(
        target,
        config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        options,
        shutdown,
    )
    .await?;

    info!("Peer exited");
    Ok(())
}
