//! Worker pool and the per-loop consumption cycle.
//!
//! Each loop repeats:
//! 1. stop if shutdown was requested
//! 2. wait while the link is reconnecting
//! 3. pull one delivery with a bounded wait
//! 4. hold it until its `deliver_at`, if it arrived early
//! 5. run the middleware pipeline and settle the outcome with the transport
//!
//! Shutdown is cooperative: a loop finishes the message it holds before exiting.

use crate::abandon::{AbandonHandler, Abandoned};
use crate::error::TransportError;
use crate::handler::Handler;
use crate::link::{Connectivity, Link};
use crate::message::Delivery;
use crate::metrics::BrokerMetrics;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Back-off after an unexpected (non-connection) receive error.
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Everything a worker loop needs, shared by all loops.
pub(crate) struct Dispatcher {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pipeline: Arc<dyn Handler>,
    pub(crate) retry: Arc<RetryPolicy>,
    pub(crate) abandon: Arc<dyn AbandonHandler>,
    pub(crate) metrics: BrokerMetrics,
    pub(crate) link: Arc<Link>,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) receive_timeout: Duration,
}

impl Dispatcher {
    async fn run_loop(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = index, queue = %self.metrics.queue(), "Worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.link.is_connected() {
                let mut link_rx = self.link.subscribe();
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = link_rx.wait_for(|s| *s == Connectivity::Connected) => {}
                }
                continue;
            }

            // Not raced against shutdown: a cancelled receive could strand a
            // delivery the backend already handed out. The wait is bounded instead.
            match self.transport.receive(self.receive_timeout).await {
                Ok(Some(delivery)) => self.process(delivery, &mut shutdown).await,
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(e) if e.is_connection() => self.link.report_lost(&e),
                Err(e) => {
                    error!(worker = index, error = %e, "Error receiving message");
                    tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                }
            }
        }

        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.active_workers(remaining);
        debug!(worker = index, "Worker loop stopped");
    }

    async fn process(&self, delivery: Delivery, shutdown: &mut watch::Receiver<bool>) {
        self.metrics.received();

        if let Some(wait) = time_until_due(&delivery) {
            debug!(message_id = %delivery.message.id, wait_ms = wait.as_millis() as u64, "Holding early message");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    // Not started yet; hand it back rather than finishing early.
                    let requeued = self.transport.nack(&delivery, true).await;
                    self.settle(requeued, &delivery, "requeue held message");
                    return;
                }
            }
        }

        let message = &delivery.message;
        self.retry.record_attempt(message);
        let start = Instant::now();

        let error = match self.pipeline.handle(message).await {
            Ok(()) => {
                self.metrics.handled(start.elapsed());
                self.retry.complete(&message.id);
                let acked = self.transport.ack(&delivery).await;
                self.settle(acked, &delivery, "ack");
                return;
            }
            Err(error) => error,
        };

        self.metrics.failed(error.category().as_str());

        match self.retry.on_failure(message, &error) {
            RetryDecision::Retry { attempt } => {
                debug!(
                    message_id = %message.id,
                    name = %message.name,
                    attempt,
                    max = self.retry.max_reconsume(),
                    error = %error,
                    "Requeueing failed message"
                );

                let mut retry = delivery.clone();
                retry.message.reconsume_count = attempt;
                self.metrics.requeued();

                let requeued = self.transport.nack(&retry, true).await;
                self.settle(requeued, &delivery, "requeue");
            }
            RetryDecision::Abandon { attempts } => {
                warn!(
                    message_id = %message.id,
                    name = %message.name,
                    attempts,
                    error = %error,
                    "Abandoning message"
                );
                self.metrics.abandoned();

                let acked = self.transport.ack(&delivery).await;
                self.settle(acked, &delivery, "ack abandoned");

                self.abandon
                    .on_abandoned(Abandoned {
                        message: delivery.message,
                        attempts,
                        error,
                    })
                    .await;
            }
        }
    }

    /// Log a failed ack/nack and report connection loss. The delivery stays with the
    /// backend, which redelivers it according to its own rules.
    fn settle(&self, result: Result<(), TransportError>, delivery: &Delivery, action: &str) {
        let Err(e) = result else {
            return;
        };

        if e.is_connection() {
            self.link.report_lost(&e);
        }
        warn!(
            message_id = %delivery.message.id,
            tag = %delivery.tag,
            action,
            error = %e,
            "Failed to settle delivery"
        );
    }
}

/// How long until the delivery is due, if it arrived early.
fn time_until_due(delivery: &Delivery) -> Option<Duration> {
    let due = delivery.message.deliver_at?;
    (due - Utc::now()).to_std().ok().filter(|wait| !wait.is_zero())
}

/// A fixed set of worker loops sharing one dispatcher.
pub(crate) struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn exactly `concurrency` loops.
    pub(crate) fn start(dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Counted before spawning so callers observe the full pool right away.
        dispatcher.active.fetch_add(concurrency, Ordering::SeqCst);
        dispatcher.metrics.active_workers(concurrency);

        let tasks = (0..concurrency)
            .map(|index| tokio::spawn(dispatcher.clone().run_loop(index, shutdown_rx.clone())))
            .collect();

        info!(
            queue = %dispatcher.metrics.queue(),
            concurrency,
            "Worker pool started"
        );

        Self { shutdown_tx, tasks }
    }

    /// Signal every loop and wait for all of them to finish their current message.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker loop ended abnormally");
            }
        }

        info!("Worker pool stopped");
    }
}
