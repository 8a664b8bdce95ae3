//! Connectivity state shared by publishers, worker loops and the reconnect supervisor.

use crate::error::TransportError;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    /// The link was lost; loops are paused and sends fail fast.
    Reconnecting,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Connected => "connected",
            Connectivity::Reconnecting => "reconnecting",
        }
    }
}

pub(crate) struct Link {
    state_tx: watch::Sender<Connectivity>,
    lost_tx: mpsc::Sender<()>,
}

impl Link {
    /// Returns the link and the receiver the supervisor listens on for loss reports.
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (state_tx, _) = watch::channel(Connectivity::Connected);
        // One pending report is enough to trigger a reconnect.
        let (lost_tx, lost_rx) = mpsc::channel(1);
        (Arc::new(Self { state_tx, lost_tx }), lost_rx)
    }

    pub(crate) fn state(&self) -> Connectivity {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == Connectivity::Connected
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state_tx.subscribe()
    }

    /// Mark the link down and wake the supervisor.
    pub(crate) fn report_lost(&self, error: &TransportError) {
        let previous = self.state_tx.send_replace(Connectivity::Reconnecting);
        if previous == Connectivity::Connected {
            warn!(error = %error, "Transport link lost, reconnecting");
        }
        let _ = self.lost_tx.try_send(());
    }

    pub(crate) fn mark_connected(&self) {
        self.state_tx.send_replace(Connectivity::Connected);
    }
}
