//! Seams to the wire-protocol client that actually speaks the WhatsApp Web
//! handshake. This crate never opens sockets itself.

use super::waiter::ConnectionSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Where the provider client reads and persists its credential.
    pub credential_dir: PathBuf,
    /// Forward verbose connection logging from the provider client.
    pub verbose: bool,
}

/// An open provider connection. Closing must be synchronous and idempotent
/// from the client's point of view; the session guarantees it calls
/// `close` at most once per handle.
pub trait ConnectionHandle: Send + Sync {
    fn close(&self);
}

/// Protocol client: implement for any linked-device transport.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open a connection against `request.credential_dir`.
    ///
    /// The client reports QR payloads and the final connection state through
    /// `events`, which it may clone and keep for as long as the socket lives.
    async fn open(
        &self,
        request: OpenRequest,
        events: ConnectionEvents,
    ) -> anyhow::Result<Box<dyn ConnectionHandle>>;
}

/// Resolve-once slot for the first QR payload of a connection.
///
/// Later emissions, and emissions after the waiting side gave up, are
/// dropped.
#[derive(Debug, Clone)]
pub struct QrSink {
    slot: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl QrSink {
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A sink nobody listens to. Used for reconnects, where the existing QR
    /// stays the one the user scans.
    pub fn detached() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns `true` if this payload was delivered.
    pub fn emit(&self, payload: impl Into<String>) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            return false;
        };
        tx.send(payload.into()).is_ok()
    }
}

/// Everything a protocol client needs to report back for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    qr: QrSink,
    signal: ConnectionSignal,
}

impl ConnectionEvents {
    pub fn new(qr: QrSink, signal: ConnectionSignal) -> Self {
        Self { qr, signal }
    }

    /// The provider issued a QR payload to scan.
    pub fn qr(&self, payload: impl Into<String>) -> bool {
        self.qr.emit(payload)
    }

    /// The phone confirmed the link and the session is established.
    pub fn connected(&self) -> bool {
        self.signal.connected()
    }

    /// The connection closed with a provider status code.
    pub fn failed(&self, status_code: Option<u16>, message: impl Into<String>) -> bool {
        self.signal.failed(status_code, message)
    }
}
