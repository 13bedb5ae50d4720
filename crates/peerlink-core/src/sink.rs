//! Outbound side of the channel.
//!
//! The host supplies something that can push a [`Message`] onto the
//! transport. Closures work directly; [`ChannelSink`] forwards into a tokio
//! channel drained by a writer task.

use crate::codec::Message;
use crate::error::{PeerlinkError, Result};
use tokio::sync::mpsc;

/// Fire-and-forget send primitive.
///
/// Implementations should not fail for a well-formed message unless the
/// channel itself is gone.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message) -> Result<()>;
}

impl<F> MessageSink for F
where
    F: Fn(Message) -> Result<()> + Send + Sync,
{
    fn send(&self, message: Message) -> Result<()> {
        self(message)
    }
}

/// Sink backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiver a writer task should drain.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| PeerlinkError::Transport {
            message: "outbound channel closed".to_string(),
        })
    }
}
