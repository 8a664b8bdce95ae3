//! The broker facade.
//!
//! Ties the registry, middleware, retry policy, delay scheduler, transport and
//! worker pool together behind one handle:
//!
//! ```rust,ignore
//! let broker = Broker::new(MemoryTransport::new(), BrokerConfig::new("bee"));
//! broker.register("print", handler_fn(|msg: Message| async move {
//!     println!("{}", msg.decode::<String>()?);
//!     Ok(())
//! }))?;
//! broker.worker().await?;
//! broker.send("print", "a").await?;
//! broker.send_delay("print", "later", Duration::from_secs(3)).await?;
//! broker.close().await?;
//! ```
//!
//! Lifecycle is `Created → Running → Closing → Closed` and never goes backward.
//! While the transport link is down, sends fail fast with
//! [`BrokerError::Disconnected`] instead of buffering; callers may retry later.

use crate::abandon::{AbandonHandler, LogAbandoned};
use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::config::BrokerConfig;
use crate::delay::{DelayMode, DelayScheduler};
use crate::error::{BrokerError, LifecycleError};
use crate::handler::{Handler, HandlerRegistry};
use crate::link::{Connectivity, Link};
use crate::message::Message;
use crate::metrics::BrokerMetrics;
use crate::middleware::{Middleware, MiddlewareChain, Recover};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::worker::{Dispatcher, WorkerPool};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            2 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        }
    }
}

/// Tasks owned while the broker is running.
struct Running {
    pool: WorkerPool,
    supervisor_stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

struct Inner {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    middleware: RwLock<MiddlewareChain>,
    retry: Arc<RetryPolicy>,
    abandon: RwLock<Arc<dyn AbandonHandler>>,
    scheduler: DelayScheduler,
    metrics: BrokerMetrics,
    link: Arc<Link>,
    lost_rx: Mutex<Option<mpsc::Receiver<()>>>,
    state: AtomicU8,
    active: Arc<AtomicUsize>,
    /// Serializes `worker` and `close`.
    running: Mutex<Option<Running>>,
}

/// Handle to a broker. Clones share the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(transport: impl Transport, config: BrokerConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let scheduler = DelayScheduler::for_transport(transport.as_ref());
        let (link, lost_rx) = Link::new();

        Self {
            inner: Arc::new(Inner {
                retry: Arc::new(RetryPolicy::new(config.max_reconsume)),
                metrics: BrokerMetrics::new(config.queue.clone()),
                config,
                transport,
                registry: Arc::new(HandlerRegistry::new()),
                middleware: RwLock::new(MiddlewareChain::new()),
                abandon: RwLock::new(Arc::new(LogAbandoned)),
                scheduler,
                link,
                lost_rx: Mutex::new(Some(lost_rx)),
                state: AtomicU8::new(LifecycleState::Created as u8),
                active: Arc::new(AtomicUsize::new(0)),
                running: Mutex::new(None),
            }),
        }
    }

    /// Replace the default abandonment logger. Takes effect when the worker starts.
    pub fn with_abandon_handler(self, handler: impl AbandonHandler) -> Self {
        *self
            .inner
            .abandon
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Running and the transport link is up.
    pub fn is_connected(&self) -> bool {
        self.state() == LifecycleState::Running && self.inner.link.is_connected()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.inner.link.state()
    }

    /// Number of worker loops currently running.
    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn delay_mode(&self) -> DelayMode {
        self.inner.scheduler.mode()
    }

    /// Register a handler under `name`. Names are unique.
    pub fn register(&self, name: impl Into<String>, handler: impl Handler) -> Result<(), BrokerError> {
        if self.state() == LifecycleState::Closed {
            return Err(LifecycleError::Closed.into());
        }
        self.inner.registry.register(name, handler)
    }

    /// Add a middleware. Only allowed before the worker starts.
    pub fn middleware(&self, middleware: impl Middleware) -> Result<(), BrokerError> {
        match self.state() {
            LifecycleState::Created => {}
            LifecycleState::Running => return Err(LifecycleError::MiddlewareFrozen.into()),
            LifecycleState::Closing | LifecycleState::Closed => {
                return Err(LifecycleError::Closed.into());
            }
        }

        self.inner
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
        Ok(())
    }

    /// Publish `payload` as JSON under `name` for immediate delivery.
    pub async fn send<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> Result<(), BrokerError> {
        self.send_message(Message::json(name, payload)?).await
    }

    /// Publish `payload` so its handler runs no earlier than `delay` from now.
    pub async fn send_delay<T: Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.ensure_sendable()?;
        let message = Message::json(name, payload)?;

        let result = self
            .inner
            .scheduler
            .schedule(self.inner.transport.as_ref(), message, delay)
            .await;

        match result {
            Ok(descriptor) => {
                self.inner.metrics.published(descriptor.is_some());
                Ok(())
            }
            Err(e) => Err(self.observe_send_error(e)),
        }
    }

    /// Publish a prebuilt message for immediate delivery.
    pub async fn send_message(&self, message: Message) -> Result<(), BrokerError> {
        self.ensure_sendable()?;

        match self.inner.transport.publish(&message).await {
            Ok(()) => {
                self.inner.metrics.published(false);
                debug!(message_id = %message.id, name = %message.name, "Sent message");
                Ok(())
            }
            Err(e) => Err(self.observe_send_error(e.into())),
        }
    }

    fn ensure_sendable(&self) -> Result<(), BrokerError> {
        match self.state() {
            LifecycleState::Created => Err(LifecycleError::NotRunning.into()),
            LifecycleState::Running if !self.inner.link.is_connected() => {
                Err(BrokerError::Disconnected)
            }
            LifecycleState::Running => Ok(()),
            LifecycleState::Closing | LifecycleState::Closed => Err(LifecycleError::Closed.into()),
        }
    }

    fn observe_send_error(&self, error: BrokerError) -> BrokerError {
        if let BrokerError::Transport(e) = &error {
            if e.is_connection() {
                self.inner.link.report_lost(e);
            }
        }
        error
    }

    /// Connect the transport and start the worker loops and reconnect supervision.
    ///
    /// Fails with `AlreadyRunning` on a second call. If the transport cannot
    /// connect the error is returned and the broker stays `Created`.
    pub async fn worker(&self) -> Result<(), BrokerError> {
        let mut running = self.inner.running.lock().await;

        match self.state() {
            LifecycleState::Created => {}
            LifecycleState::Running => return Err(LifecycleError::AlreadyRunning.into()),
            LifecycleState::Closing | LifecycleState::Closed => {
                return Err(LifecycleError::Closed.into());
            }
        }

        self.inner.transport.connect().await?;
        self.inner.link.mark_connected();

        let Some(lost_rx) = self.inner.lost_rx.lock().await.take() else {
            return Err(LifecycleError::AlreadyRunning.into());
        };

        let dispatcher = Arc::new(Dispatcher {
            transport: self.inner.transport.clone(),
            pipeline: self.build_pipeline(),
            retry: self.inner.retry.clone(),
            abandon: self
                .inner
                .abandon
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            metrics: self.inner.metrics.clone(),
            link: self.inner.link.clone(),
            active: self.inner.active.clone(),
            receive_timeout: self.inner.config.receive_timeout,
        });

        let concurrency = self.inner.config.effective_concurrency();
        let pool = WorkerPool::start(dispatcher, concurrency);

        let (supervisor_stop, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            self.inner.transport.clone(),
            self.inner.link.clone(),
            self.inner.metrics.clone(),
            self.inner.config.reconnect.clone(),
            lost_rx,
            stop_rx,
        ));

        *running = Some(Running {
            pool,
            supervisor_stop,
            supervisor,
        });
        self.set_state(LifecycleState::Running);

        info!(
            queue = %self.inner.config.queue,
            transport = self.inner.transport.name(),
            concurrency,
            handlers = ?self.inner.registry.names(),
            "Broker started"
        );
        Ok(())
    }

    /// Recover outermost, then user middleware in registration order, then routing.
    fn build_pipeline(&self) -> Arc<dyn Handler> {
        let routed = self
            .inner
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build(self.inner.registry.clone());

        let mut outer = MiddlewareChain::new();
        outer.push(Recover);
        outer.build(routed)
    }

    /// Stop the worker loops, wait for in-flight messages, and close the transport.
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut running = self.inner.running.lock().await;

        if self.state() == LifecycleState::Closed {
            return Ok(());
        }
        self.set_state(LifecycleState::Closing);
        info!(queue = %self.inner.config.queue, "Closing broker");

        if let Some(run) = running.take() {
            run.pool.stop().await;
            let _ = run.supervisor_stop.send(true);
            if let Err(e) = run.supervisor.await {
                error!(error = %e, "Reconnect supervisor ended abnormally");
            }
        }

        let closed = self.inner.transport.close().await;
        self.set_state(LifecycleState::Closed);

        closed?;
        info!(queue = %self.inner.config.queue, "Broker closed");
        Ok(())
    }
}

/// Wait for loss reports and reconnect with backoff until it works or the broker stops.
async fn supervise(
    transport: Arc<dyn Transport>,
    link: Arc<Link>,
    metrics: BrokerMetrics,
    backoff: BackoffConfig,
    mut lost_rx: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let transport = transport.as_ref();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            lost = lost_rx.recv() => {
                if lost.is_none() {
                    return;
                }
            }
        }

        loop {
            info!(transport = transport.name(), "Reconnecting to transport");

            let attempt = retry_with_backoff(move || transport.connect(), backoff.clone());
            let result = tokio::select! {
                _ = stop_rx.changed() => return,
                result = attempt => result,
            };

            match result {
                Ok(()) => {
                    link.mark_connected();
                    metrics.reconnected();
                    info!(transport = transport.name(), "Reconnected to transport");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Reconnect attempts exhausted, starting over");
                    tokio::time::sleep(backoff.delay_for(1)).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queue", &self.inner.config.queue)
            .field("state", &self.state())
            .field("connectivity", &self.connectivity())
            .field("active_workers", &self.active_workers())
            .finish()
    }
}
