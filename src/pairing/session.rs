//! The mutable record of one pairing attempt.

use super::client::ConnectionHandle;
use super::error::DisconnectKind;
use super::restart::RestartToken;
use super::waiter::{ConnectionWaiter, Settlement};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Default freshness window for a pairing attempt.
pub const SESSION_TTL: Duration = Duration::from_millis(180_000);

/// Final (or not yet final) result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Connected,
    Failed {
        kind: DisconnectKind,
        status_code: Option<u16>,
        message: String,
    },
}

/// Observable lifecycle position, derived from the session's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    AwaitingQr,
    QrIssued,
    Restarting,
    Connected,
    Failed,
    Expired,
}

/// A QR payload together with its rendered `data:image/png;base64,...` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedQr {
    pub payload: String,
    pub data_url: String,
}

pub struct PairingSession {
    account_id: String,
    credential_dir: PathBuf,
    session_id: String,
    created_at: Instant,
    started_at: DateTime<Utc>,
    verbose: bool,
    qr: Option<IssuedQr>,
    restart: Option<RestartToken>,
    waiter: ConnectionWaiter,
    handle: Option<Box<dyn ConnectionHandle>>,
}

impl PairingSession {
    pub fn new(
        account_id: impl Into<String>,
        credential_dir: impl Into<PathBuf>,
        verbose: bool,
        handle: Box<dyn ConnectionHandle>,
        waiter: ConnectionWaiter,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            credential_dir: credential_dir.into(),
            session_id: new_session_id(),
            created_at: Instant::now(),
            started_at: Utc::now(),
            verbose,
            qr: None,
            restart: Some(RestartToken::new()),
            waiter,
            handle: Some(handle),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn credential_dir(&self) -> &Path {
        &self.credential_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn qr(&self) -> Option<&IssuedQr> {
        self.qr.as_ref()
    }

    /// Settlement of the current handle, as reported by its waiter.
    pub fn outcome(&self) -> Outcome {
        match self.waiter.settled() {
            None => Outcome::Pending,
            Some(Settlement::Connected) => Outcome::Connected,
            Some(Settlement::Failed {
                status_code,
                message,
            }) => Outcome::Failed {
                kind: DisconnectKind::classify(status_code),
                status_code,
                message,
            },
        }
    }

    pub fn waiter(&self) -> ConnectionWaiter {
        self.waiter.clone()
    }

    pub fn restart_used(&self) -> bool {
        self.restart.is_none()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        self.age(now) < ttl
    }

    /// Record the first QR for the current handle. Later calls keep the
    /// original and return it.
    pub fn issue_qr(&mut self, payload: String, data_url: String) -> &IssuedQr {
        self.qr.get_or_insert(IssuedQr { payload, data_url })
    }

    /// Take the one-shot restart capability, if it has not been used.
    pub fn take_restart_token(&mut self) -> Option<RestartToken> {
        self.restart.take()
    }

    /// Close the current connection handle. Safe to call repeatedly; the
    /// handle itself is closed once.
    pub fn close_handle(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Start a forced reconnect: close the current handle, arm `waiter` for
    /// the replacement and regenerate the session id so completions from the
    /// old handle are recognisably stale. Consumes this session's restart token.
    pub fn begin_restart(&mut self, _token: RestartToken, waiter: ConnectionWaiter) -> &str {
        self.close_handle();
        self.waiter = waiter;
        self.session_id = new_session_id();
        &self.session_id
    }

    /// Attach the handle opened for a restart begun with [`Self::begin_restart`].
    pub fn attach_handle(&mut self, handle: Box<dyn ConnectionHandle>) {
        self.close_handle();
        self.handle = Some(handle);
    }

    pub fn state(&self, ttl: Duration, now: Instant) -> PairingState {
        match self.outcome() {
            Outcome::Connected => PairingState::Connected,
            Outcome::Failed {
                kind: DisconnectKind::RestartRequired,
                ..
            } if !self.restart_used() => PairingState::Restarting,
            Outcome::Failed { .. } => PairingState::Failed,
            Outcome::Pending if !self.is_fresh(ttl, now) => PairingState::Expired,
            Outcome::Pending if self.handle.is_none() => PairingState::Restarting,
            Outcome::Pending if self.qr.is_some() => PairingState::QrIssued,
            Outcome::Pending => PairingState::AwaitingQr,
        }
    }

    pub fn summary(&self, ttl: Duration, now: Instant) -> SessionSummary {
        SessionSummary {
            account_id: self.account_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state(ttl, now),
            started_at: self.started_at,
            age_ms: u64::try_from(self.age(now).as_millis()).unwrap_or(u64::MAX),
            qr_issued: self.qr.is_some(),
            restart_used: self.restart_used(),
        }
    }
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        self.close_handle();
    }
}

/// Serializable view of a stored attempt, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub account_id: String,
    pub session_id: String,
    pub state: PairingState,
    pub started_at: DateTime<Utc>,
    pub age_ms: u64,
    pub qr_issued: bool,
    pub restart_used: bool,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
