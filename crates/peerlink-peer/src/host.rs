//! Newline-delimited JSON host for a single router.
//!
//! Every line read from the input is one inbound message. A reader task reads
//! at most `max_message_size` bytes per line and skips the rest of longer
//! lines. Outbound messages are queued on a [`ChannelSink`] and written one per
//! line by a writer task. The connection ends on EOF, on a write failure, or
//! when `shutdown` resolves.

use anyhow::{Context, Result};
use peerlink::{ChannelSink, Message, PeerlinkError, ProtocolConfig, Router, RouterConfig, RpcTarget};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

/// A call to issue once negotiation completes.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Publish the local protocol table on startup.
    pub announce: bool,
    /// Issue this call after negotiation, then shut down once it completes.
    pub call: Option<OutboundCall>,
    /// Longest accepted inbound line, excluding the newline.
    pub max_message_size: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            announce: true,
            call: None,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
        }
    }
}

/// One unit read from the input.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(Vec<u8>),
    /// A line longer than the limit; its bytes were discarded.
    Oversized(usize),
}

const DISCARD_CHUNK: u64 = 64 * 1024;
const INBOUND_QUEUE: usize = 32;

type CallTask = JoinHandle<peerlink::Result<Value>>;

/// Run one connection to completion.
pub async fn run<T, R, W, F>(
    target: T,
    config: RouterConfig,
    reader: R,
    writer: W,
    options: HostOptions,
    shutdown: F,
) -> Result<()>
where
    T: RpcTarget,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (sink, outbound) = ChannelSink::pair();
    let writer_task = tokio::spawn(write_loop(writer, outbound));

    let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_QUEUE);
    let reader_task = tokio::spawn(read_loop(reader, options.max_message_size, inbound_tx));

    let mut router = Router::with_config(target, sink, config)?;
    if options.announce {
        router.announce()?;
    }

    let mut reaper = router.config().call_timeout.map(|timeout| {
        let mut interval = tokio::time::interval(timeout);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let reap_age = router.config().call_timeout.unwrap_or(Duration::MAX);

    let mut queued_call = options.call;
    let mut call_task: Option<CallTask> = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            frame = inbound.recv() => {
                match frame {
                    Some(Ok(Frame::Line(line))) => {
                        if let Err(e) = handle_line(&mut router, &line) {
                            if matches!(e, PeerlinkError::Transport { .. }) {
                                error!("Outbound channel closed: {}", e);
                                break;
                            }
                            warn!("{}", e);
                        }
                    }
                    Some(Ok(Frame::Oversized(len))) => {
                        warn!(
                            "Skipped inbound message of {} bytes, limit is {}",
                            len, options.max_message_size
                        );
                    }
                    Some(Err(e)) => {
                        reader_task.abort();
                        return Err(e).context("Failed to read inbound message");
                    }
                    None => {
                        info!("Input closed, shutting down");
                        break;
                    }
                }
            }
            outcome = join_call(&mut call_task) => {
                call_task = None;
                match outcome {
                    Ok(Ok(result)) => info!("Call result: {}", result),
                    Ok(Err(e)) => error!("Call failed: {}", e),
                    Err(e) => error!("Call task failed: {}", e),
                }
                break;
            }
            _ = tick(&mut reaper) => {
                router.reap_stale(reap_age);
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }

        if router.is_ready() {
            if let Some(call) = queued_call.take() {
                info!("Calling {} on peer", call.method);
                let reply = router.call(&call.method, call.args)?.send()?;
                call_task = Some(tokio::spawn(reply.wait()));
            }
        }
    }

    reader_task.abort();
    router.close();
    writer_task
        .await
        .context("Writer task panicked")?
        .context("Failed to write outbound message")?;
    Ok(())
}

fn handle_line<T: RpcTarget>(router: &mut Router<T>, line: &[u8]) -> peerlink::Result<()> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(());
    }

    let msg: Value = serde_json::from_slice(line).map_err(|e| PeerlinkError::Parse {
        message: format!("inbound line is not JSON: {}", e),
    })?;
    debug!("Received: {}", msg);
    router.handle_message(msg)
}

/// Read one newline-terminated frame, buffering at most `limit + 1` bytes.
///
/// Returns `None` at EOF. A final line without a newline is still a frame.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(Some(Frame::Line(buf)));
    }
    if buf.len() <= limit {
        return Ok(Some(Frame::Line(buf)));
    }

    // Over the limit: drop the rest of the line without keeping it.
    let mut skipped = buf.len();
    loop {
        buf.clear();
        let read = (&mut *reader)
            .take(DISCARD_CHUNK)
            .read_until(b'\n', &mut buf)
            .await?;
        skipped += read;
        if read == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    Ok(Some(Frame::Oversized(skipped)))
}

async fn read_loop<R>(
    mut reader: R,
    limit: usize,
    inbound: mpsc::Sender<std::io::Result<Frame>>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader, limit).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        let failed = frame.is_err();
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: UnboundedReceiver<Message>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut bytes = serde_json::to_vec(&message)?;
        match message.id() {
            Some(id) => debug!("Sending {}: {}", id, String::from_utf8_lossy(&bytes)),
            None => debug!("Sending: {}", String::from_utf8_lossy(&bytes)),
        }
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn join_call(
    task: &mut Option<CallTask>,
) -> std::result::Result<peerlink::Result<Value>, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
