//! Single-resolution connection futures.
//!
//! The protocol client reports how a connection ended through a
//! [`ConnectionSignal`]; every clone of the matching [`ConnectionWaiter`]
//! observes the same settlement. The first settlement wins and later ones are
//! dropped, so a connection can never be both connected and failed.
//! Rearming (after a forced reconnect) means calling [`arm`] again and
//! swapping the waiter stored on the session.

use std::sync::Arc;
use tokio::sync::watch;

/// How a connection handle finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Connected,
    Failed {
        status_code: Option<u16>,
        message: String,
    },
}

/// Write side, handed to the protocol client.
#[derive(Debug, Clone)]
pub struct ConnectionSignal {
    tx: Arc<watch::Sender<Option<Settlement>>>,
}

impl ConnectionSignal {
    /// Report an established session. Returns `false` if already settled.
    pub fn connected(&self) -> bool {
        self.settle(Settlement::Connected)
    }

    /// Report a disconnect. Returns `false` if already settled.
    pub fn failed(&self, status_code: Option<u16>, message: impl Into<String>) -> bool {
        self.settle(Settlement::Failed {
            status_code,
            message: message.into(),
        })
    }

    fn settle(&self, settlement: Settlement) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(settlement);
            true
        })
    }
}

/// Read side, stored on the pairing session.
#[derive(Debug, Clone)]
pub struct ConnectionWaiter {
    rx: watch::Receiver<Option<Settlement>>,
}

impl ConnectionWaiter {
    /// The settlement, if one has already been reported.
    pub fn settled(&self) -> Option<Settlement> {
        self.rx.borrow().clone()
    }

    /// Resolve once the connection settles.
    ///
    /// Returns `None` when every signal was dropped without settling, i.e. the
    /// connection ended without ever reporting connected or failed.
    pub async fn wait(&self) -> Option<Settlement> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        settled
    }
}

/// Create a fresh signal/waiter pair for one connection handle.
pub fn arm() -> (ConnectionSignal, ConnectionWaiter) {
    let (tx, rx) = watch::channel(None);
    (ConnectionSignal { tx: Arc::new(tx) }, ConnectionWaiter { rx })
}
