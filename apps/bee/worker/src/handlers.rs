//! Demo handlers
//!
//! - `print`: logs a string payload
//! - `sleep`: sleeps for the number of milliseconds in the payload
//! - `counter`: bumps a shared counter
//! - `error`: always fails with a transient error, exercising retry and abandonment
//! - `delay`: logs how long after its due time a delayed message arrived

use async_trait::async_trait;
use broker::{handler_fn, Broker, BrokerError, Handler, HandlerError, Message};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// State shared by the demo handlers.
#[derive(Debug, Default)]
pub struct DemoState {
    counter: AtomicU64,
    failures: AtomicU64,
}

impl DemoState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Invocations of the `error` handler.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

pub struct CounterHandler {
    state: Arc<DemoState>,
}

#[async_trait]
impl Handler for CounterHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let total = self.state.counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(message_id = %message.id, total, "counter");
        Ok(())
    }
}

pub struct ErrorHandler {
    state: Arc<DemoState>,
}

#[async_trait]
impl Handler for ErrorHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.state.failures.fetch_add(1, Ordering::SeqCst);
        let reason = message.text().unwrap_or("error").to_string();
        warn!(
            message_id = %message.id,
            reconsume_count = message.reconsume_count,
            %reason,
            "error handler failing on purpose"
        );
        Err(HandlerError::transient(reason))
    }
}

async fn print(message: Message) -> Result<(), HandlerError> {
    let text: String = message.decode()?;
    info!(message_id = %message.id, %text, "print");
    Ok(())
}

async fn sleep(message: Message) -> Result<(), HandlerError> {
    let millis: u64 = message.decode()?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    info!(message_id = %message.id, millis, "slept");
    Ok(())
}

async fn delay(message: Message) -> Result<(), HandlerError> {
    let Some(due) = message.deliver_at else {
        info!(message_id = %message.id, "delay handler got an undelayed message");
        return Ok(());
    };

    let late = Utc::now() - due;
    if late < chrono::Duration::zero() {
        warn!(message_id = %message.id, early_ms = -late.num_milliseconds(), "delayed message arrived early");
    } else {
        info!(message_id = %message.id, late_ms = late.num_milliseconds(), "delayed message arrived");
    }
    Ok(())
}

/// Register every demo handler on `broker`.
pub fn register_all(broker: &Broker, state: Arc<DemoState>) -> Result<(), BrokerError> {
    broker.register("print", handler_fn(print))?;
    broker.register("sleep", handler_fn(sleep))?;
    broker.register("delay", handler_fn(delay))?;
    broker.register(
        "counter",
        CounterHandler {
            state: state.clone(),
        },
    )?;
    broker.register("error", ErrorHandler { state })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_handler_increments() {
        let state = DemoState::new();
        let handler = CounterHandler {
            state: state.clone(),
        };

        for _ in 0..3 {
            handler.handle(&Message::new("counter", "{}")).await.unwrap();
        }

        assert_eq!(state.count(), 3);
    }

    #[tokio::test]
    async fn test_error_handler_is_transient() {
        let state = DemoState::new();
        let handler = ErrorHandler {
            state: state.clone(),
        };

        let err = handler
            .handle(&Message::new("error", "boom"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err, HandlerError::transient("boom"));
        assert_eq!(state.failures(), 1);
    }

    #[tokio::test]
    async fn test_print_rejects_undecodable_payload() {
        let err = print(Message::new("print", "not json")).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delay_accepts_due_and_undelayed_messages() {
        let mut msg = Message::new("delay", "{}");
        delay(msg.clone()).await.unwrap();

        msg.deliver_at = Some(Utc::now() - chrono::Duration::milliseconds(5));
        delay(msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_sleep_waits_for_payload_millis() {
        let msg = Message::json("sleep", &20u64).unwrap();
        let start = std::time::Instant::now();
        sleep(msg).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
