//! In-process transport.
//!
//! A FIFO queue shared by all clones, with a min-heap for delayed messages and an
//! in-flight table for unacknowledged deliveries. Useful for tests and for running
//! the broker without external infrastructure.

use super::Transport;
use crate::delay::DelayMode;
use crate::error::TransportError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A message waiting for its delivery time.
struct Scheduled {
    due: DateTime<Utc>,
    seq: u64,
    message: Message,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest due time first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    ready: VecDeque<Message>,
    scheduled: BinaryHeap<Scheduled>,
    in_flight: HashMap<String, Message>,
    seq: u64,
}

impl State {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while self.scheduled.peek().is_some_and(|s| s.due <= now) {
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.message);
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
    reachable: AtomicBool,
    closed: AtomicBool,
    next_tag: AtomicU64,
}

/// In-memory [`Transport`]. Clones share the same queue.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                connected: AtomicBool::new(false),
                reachable: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "memory transport disconnected".into(),
            ));
        }
        Ok(())
    }

    /// Drop the link as if the backend went away.
    ///
    /// Unacknowledged deliveries go back to the front of the queue, the way a
    /// broker redelivers when a channel dies. Blocked receivers wake up with a
    /// connection error.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        {
            let mut state = self.state();
            let in_flight: Vec<Message> = state.in_flight.drain().map(|(_, m)| m).collect();
            for message in in_flight {
                state.ready.push_front(message);
            }
        }
        self.shared.notify.notify_waiters();
        debug!("Memory transport disconnected");
    }

    /// Make `connect` fail (`false`) or succeed (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Messages ready for delivery.
    pub fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages waiting for their delivery time.
    pub fn scheduled_len(&self) -> usize {
        self.state().scheduled.len()
    }

    /// Deliveries handed out but not yet acked or nacked.
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Pop the next ready message, or report when the next delayed one is due.
    fn try_take(&self) -> Result<Option<Delivery>, Option<DateTime<Utc>>> {
        let mut state = self.state();
        state.promote_due(Utc::now());

        match state.ready.pop_front() {
            Some(message) => {
                let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst).to_string();
                state.in_flight.insert(tag.clone(), message.clone());
                Ok(Some(Delivery::new(message, tag)))
            }
            None => Err(state.scheduled.peek().map(|s| s.due)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn delay_mode(&self) -> DelayMode {
        DelayMode::Native
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "memory transport unreachable".into(),
            ));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        self.check_link()?;
        self.state().ready.push_back(message.clone());
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn publish_delayed(
        &self,
        message: &Message,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        self.check_link()?;

        let mut message = message.clone();
        message.deliver_at = Some(deliver_at);

        {
            let mut state = self.state();
            if deliver_at <= Utc::now() {
                state.ready.push_back(message);
            } else {
                state.seq += 1;
                let seq = state.seq;
                state.scheduled.push(Scheduled {
                    due: deliver_at,
                    seq,
                    message,
                });
            }
        }

        // Wake a receiver so it recomputes how long to sleep.
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            self.check_link()?;

            let next_due = match self.try_take() {
                Ok(delivery) => return Ok(delivery),
                Err(next_due) => next_due,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(due) = next_due {
                let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_for = sleep_for.min(until_due);
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.check_link()?;
        self.state()
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownDelivery(delivery.tag.clone()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.check_link()?;
        {
            let mut state = self.state();
            if state.in_flight.remove(&delivery.tag).is_none() {
                return Err(TransportError::UnknownDelivery(delivery.tag.clone()));
            }
            if requeue {
                state.ready.push_back(delivery.message.clone());
            }
        }
        if requeue {
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let transport = connected().await;
        for name in ["a", "b", "c"] {
            transport.publish(&Message::new(name, Vec::new())).await.unwrap();
        }

        let mut names = Vec::new();
        while let Some(delivery) = transport.receive(Duration::from_millis(10)).await.unwrap() {
            transport.ack(&delivery).await.unwrap();
            names.push(delivery.message.name);
        }

        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(transport.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let transport = connected().await;
        let got = transport.receive(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let transport = connected().await;
        let publisher = transport.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&Message::new("late", Vec::new())).await.unwrap();
        });

        let delivery = transport.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(delivery.unwrap().message.name, "late");
    }

    #[tokio::test]
    async fn test_delayed_not_visible_before_due() {
        let transport = connected().await;
        let due = Utc::now() + chrono::Duration::milliseconds(150);
        transport
            .publish_delayed(&Message::new("delay", Vec::new()), due)
            .await
            .unwrap();

        assert!(transport.receive(Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(transport.scheduled_len(), 1);

        let delivery = transport
            .receive(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert!(Utc::now() >= due);
        assert_eq!(delivery.message.deliver_at, Some(due));
    }

    #[tokio::test]
    async fn test_nack_requeue_carries_updated_message() {
        let transport = connected().await;
        transport.publish(&Message::new("error", Vec::new())).await.unwrap();

        let mut delivery = transport
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        delivery.message.reconsume_count = 1;
        transport.nack(&delivery, true).await.unwrap();

        let again = transport
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.message.id, delivery.message.id);
        assert_eq!(again.message.reconsume_count, 1);
        assert_ne!(again.tag, delivery.tag);
    }

    #[tokio::test]
    async fn test_ack_unknown_tag() {
        let transport = connected().await;
        let delivery = Delivery::new(Message::new("n", Vec::new()), "missing");
        assert!(matches!(
            transport.ack(&delivery).await,
            Err(TransportError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let transport = connected().await;
        transport.publish(&Message::new("n", Vec::new())).await.unwrap();
        let _unacked = transport.receive(Duration::from_millis(10)).await.unwrap();

        transport.disconnect();
        transport.set_reachable(false);

        let err = transport.publish(&Message::new("n", Vec::new())).await.unwrap_err();
        assert!(err.is_connection());
        assert!(transport.connect().await.unwrap_err().is_connection());

        transport.set_reachable(true);
        transport.connect().await.unwrap();

        // The unacked delivery is handed out again after the outage.
        assert_eq!(transport.ready_len(), 1);
        assert!(transport.receive(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = connected().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(matches!(
            transport.publish(&Message::new("n", Vec::new())).await,
            Err(TransportError::Closed)
        ));
    }
}
