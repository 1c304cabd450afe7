//! One forced reconnect per pairing attempt.
//!
//! After the phone scans the QR, the provider typically closes the stream
//! with status 515 and expects the client to reconnect using the credential
//! it just persisted. The session carries a single [`RestartToken`]; taking
//! it is the only way to begin a replacement connection, so "restart
//! already used" cannot be bypassed.

use super::client::{ConnectionEvents, OpenRequest, ProtocolClient, QrSink};
use super::error::PairingError;
use super::registry::SessionRegistry;
use super::waiter::{self, ConnectionWaiter};
use tracing::{info, warn};

/// Capability to reconnect a session once. Not `Clone`.
#[derive(Debug)]
pub struct RestartToken {
    _private: (),
}

impl RestartToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug)]
pub enum RestartOutcome {
    /// A new handle is installed; wait on `waiter` for the session `session_id`.
    Reconnected {
        session_id: String,
        waiter: ConnectionWaiter,
    },
    /// This session already spent its restart.
    Exhausted,
    /// The session was evicted or replaced while restarting.
    Superseded,
    /// The replacement connection for `session_id` could not be opened. The
    /// session's waiter has been settled with the failure.
    ReopenFailed {
        session_id: String,
        error: PairingError,
    },
}

pub struct RestartPolicy<'a> {
    registry: &'a SessionRegistry,
    client: &'a dyn ProtocolClient,
}

impl<'a> RestartPolicy<'a> {
    pub fn new(registry: &'a SessionRegistry, client: &'a dyn ProtocolClient) -> Self {
        Self { registry, client }
    }

    /// Close the current handle of `session_id` and open a replacement
    /// against the same credential directory.
    ///
    /// The session id rotates and the new waiter is stored before the
    /// replacement is opened, so concurrent waiters on the old id follow the
    /// reconnect instead of racing to spend the token.
    pub async fn restart(&self, account_id: &str, session_id: &str) -> RestartOutcome {
        let (signal, waiter) = waiter::arm();
        let prepared = self.registry.update_if(account_id, session_id, |session| {
            let token = session.take_restart_token()?;
            let request = OpenRequest {
                credential_dir: session.credential_dir().to_path_buf(),
                verbose: session.verbose(),
            };
            let new_session_id = session.begin_restart(token, waiter.clone()).to_string();
            Some((new_session_id, request))
        });

        let (new_session_id, request) = match prepared {
            None => return RestartOutcome::Superseded,
            Some(None) => {
                warn!(account = %account_id, "pairing.restart_exhausted");
                return RestartOutcome::Exhausted;
            }
            Some(Some(prepared)) => prepared,
        };

        info!(account = %account_id, session = %new_session_id, "pairing.restart");
        let events = ConnectionEvents::new(QrSink::detached(), signal.clone());
        let handle = match self.client.open(request, events).await {
            Ok(handle) => handle,
            Err(err) => {
                let error = PairingError::HandleOpen(format!("{err:#}"));
                warn!(account = %account_id, error = %error, "pairing.restart_failed");
                signal.failed(None, error.to_string());
                return RestartOutcome::ReopenFailed {
                    session_id: new_session_id,
                    error,
                };
            }
        };

        let mut handle = Some(handle);
        let attached = self
            .registry
            .update_if(account_id, &new_session_id, |session| {
                if let Some(handle) = handle.take() {
                    session.attach_handle(handle);
                }
            });

        if attached.is_none() {
            // Evicted or replaced while the new socket was opening.
            if let Some(orphan) = handle.take() {
                orphan.close();
            }
            return RestartOutcome::Superseded;
        }
        RestartOutcome::Reconnected {
            session_id: new_session_id,
            waiter,
        }
    }
}
