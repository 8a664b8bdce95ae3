//! Reporting of messages that ran out of attempts.
//!
//! The broker acknowledges an abandoned message so the transport drops it; beyond
//! that it keeps no dead-letter store. Plug in an [`AbandonHandler`] to persist or
//! forward abandoned messages.

use crate::error::HandlerError;
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

/// A message that reached its terminal failed state.
#[derive(Debug, Clone)]
pub struct Abandoned {
    pub message: Message,
    /// Handler invocations made, including the last one.
    pub attempts: u32,
    /// The error from the last invocation.
    pub error: HandlerError,
}

#[async_trait]
pub trait AbandonHandler: Send + Sync + 'static {
    async fn on_abandoned(&self, abandoned: Abandoned);
}

/// Default handler: log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAbandoned;

#[async_trait]
impl AbandonHandler for LogAbandoned {
    async fn on_abandoned(&self, abandoned: Abandoned) {
        error!(
            message_id = %abandoned.message.id,
            name = %abandoned.message.name,
            attempts = abandoned.attempts,
            error = %abandoned.error,
            "Message abandoned"
        );
    }
}

/// Forward abandoned messages to a channel. A closed receiver is ignored.
#[async_trait]
impl AbandonHandler for mpsc::UnboundedSender<Abandoned> {
    async fn on_abandoned(&self, abandoned: Abandoned) {
        let _ = self.send(abandoned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_handler_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg = Message::new("error", Vec::new());

        tx.on_abandoned(Abandoned {
            message: msg.clone(),
            attempts: 3,
            error: HandlerError::transient("err"),
        })
        .await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.id, msg.id);
        assert_eq!(got.attempts, 3);
    }

    #[tokio::test]
    async fn test_channel_handler_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        tx.on_abandoned(Abandoned {
            message: Message::new("error", Vec::new()),
            attempts: 1,
            error: HandlerError::permanent("bad"),
        })
        .await;
    }
}
