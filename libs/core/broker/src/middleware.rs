//! Middleware wrapped around handler invocation.
//!
//! A middleware receives the message and a [`Next`] pointing at the rest of the
//! chain. It may inspect or replace the message, inspect or replace the outcome,
//! or skip the rest of the chain entirely.
//!
//! ```text
//! Recover → user middleware (registration order) → HandlerRegistry → handler
//! ```

use crate::error::HandlerError;
use crate::handler::Handler;
use crate::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Instrument};

/// The remainder of the chain below a middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    inner: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn new(inner: &'a dyn Handler) -> Self {
        Self { inner }
    }

    /// Invoke the next layer. Pass a modified copy to change what it sees.
    pub async fn run(self, message: &Message) -> Result<(), HandlerError> {
        self.inner.handle(message).await
    }
}

/// A layer around handler invocation.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
        (**self).handle(message, next).await
    }
}

/// One middleware bound to the layer it wraps.
struct Layered {
    middleware: Arc<dyn Middleware>,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Layered {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.middleware
            .handle(message, Next::new(self.inner.as_ref()))
            .await
    }
}

/// Ordered list of middleware. The first one pushed is the outermost.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: impl Middleware) {
        self.layers.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Compose the chain around `handler`. Can be called again after more pushes.
    pub fn build(&self, handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
        self.layers.iter().rev().fold(handler, |inner, middleware| {
            Arc::new(Layered {
                middleware: middleware.clone(),
                inner,
            }) as Arc<dyn Handler>
        })
    }
}

/// Converts a panic anywhere below it into a retryable [`HandlerError::Panicked`].
///
/// The broker always installs this as the outermost layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recover;

#[async_trait]
impl Middleware for Recover {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
        match AssertUnwindSafe(next.run(message)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(
                    message_id = %message.id,
                    name = %message.name,
                    panic = %reason,
                    "Handler panicked"
                );
                Err(HandlerError::Panicked(reason))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs each invocation inside a span and logs the cost and outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

#[async_trait]
impl Middleware for Logging {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
        let span = info_span!(
            "handle",
            message_id = %message.id,
            name = %message.name,
            attempt = message.reconsume_count + 1
        );

        async move {
            let start = Instant::now();
            let outcome = next.run(message).await;
            let cost_ms = start.elapsed().as_millis() as u64;

            match &outcome {
                Ok(()) => debug!(cost_ms, "Handled message"),
                Err(e) => warn!(cost_ms, error = %e, "Handler failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

/// Fails an invocation that runs longer than the deadline.
///
/// The core imposes no deadline of its own; add this layer when handlers must be bounded.
/// The timed-out future is dropped, which cancels the handler at its next await point.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    deadline: Duration,
}

impl Timeout {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

#[async_trait]
impl Middleware for Timeout {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
        match tokio::time::timeout(self.deadline, next.run(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::transient(format!(
                "handler timed out after {}ms",
                self.deadline.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::Mutex;

    /// Records entry and exit around the next layer.
    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Trace {
        async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let outcome = next.run(message).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            outcome
        }
    }

    /// Never calls the next layer.
    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        async fn handle(&self, _message: &Message, _next: Next<'_>) -> Result<(), HandlerError> {
            Err(HandlerError::permanent("rejected"))
        }
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |_msg: Message| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.push(Trace { label: "a", log: log.clone() });
        chain.push(Trace { label: "b", log: log.clone() });

        let pipeline = chain.build(recording_handler(log.clone()));
        pipeline.handle(&Message::new("n", Vec::new())).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.push(Reject);

        let pipeline = chain.build(recording_handler(log.clone()));
        let err = pipeline.handle(&Message::new("n", Vec::new())).await.unwrap_err();

        assert_eq!(err, HandlerError::permanent("rejected"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_converts_panic() {
        let mut chain = MiddlewareChain::new();
        chain.push(Recover);

        let pipeline = chain.build(Arc::new(handler_fn(|msg: Message| async move {
            if msg.name == "n" {
                panic!("handler defect");
            }
            Ok(())
        })));

        let err = pipeline.handle(&Message::new("n", Vec::new())).await.unwrap_err();
        assert_eq!(err, HandlerError::Panicked("handler defect".into()));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_fails_slow_handler() {
        let mut chain = MiddlewareChain::new();
        chain.push(Timeout::new(Duration::from_millis(20)));

        let pipeline = chain.build(Arc::new(handler_fn(|_msg: Message| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })));

        let err = pipeline.handle(&Message::new("n", Vec::new())).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_the_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());

        chain
            .build(recording_handler(log.clone()))
            .handle(&Message::new("n", Vec::new()))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["handler"]);
    }
}
