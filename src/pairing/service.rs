//! `start_login` / `wait_for_login` and the small operations around them.
//!
//! Nothing here returns an error across the public boundary: every failure
//! is reported as a result message so chat and CLI callers can relay it.

use super::client::{ConnectionEvents, OpenRequest, ProtocolClient, QrSink};
use super::credentials::{CredentialStore, SelfIdentity};
use super::error::{DisconnectKind, PairingError};
use super::qr::{QrRenderer, to_data_url};
use super::registry::{SessionRegistry, SessionView};
use super::restart::{RestartOutcome, RestartPolicy};
use super::session::{IssuedQr, PairingSession, SessionSummary};
use super::waiter::{self, ConnectionWaiter, Settlement};
use crate::config::{PairingConfig, normalize_account_id};
use crate::health;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MSG_SCAN: &str = "Scan this QR in WhatsApp → Linked Devices.";
const MSG_QR_ACTIVE: &str =
    "QR already active. Scan it in WhatsApp → Linked Devices, then wait for the link.";
const MSG_LINKED: &str = "Linked! WhatsApp is ready.";
const MSG_NO_PAIRING: &str = "No pairing in progress. Start a WhatsApp login first.";
const MSG_EXPIRED: &str = "The pairing expired. Start a new login to get a fresh QR.";
const MSG_LOGGED_OUT: &str = "WhatsApp reported the session is logged out. Cleared the cached \
     credential; start a new login and scan a fresh QR.";
const MSG_ENDED: &str = "Pairing ended without connecting.";
const MSG_CANCELLED: &str = "Pairing was cancelled before the QR code arrived.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartLoginOptions {
    /// Relink even if a credential already exists.
    pub force: bool,
    /// Open-timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitLoginOptions {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartLoginResult {
    /// `data:image/png;base64,...` when a QR is ready to scan.
    pub qr_image: Option<String>,
    pub message: String,
    /// Raw payload, for terminal rendering. Never serialized.
    #[serde(skip)]
    pub qr_payload: Option<String>,
}

impl StartLoginResult {
    fn message(message: impl Into<String>) -> Self {
        Self {
            qr_image: None,
            message: message.into(),
            qr_payload: None,
        }
    }

    fn qr(qr_image: String, qr_payload: String, message: &str) -> Self {
        Self {
            qr_image: Some(qr_image),
            message: message.to_string(),
            qr_payload: Some(qr_payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitLoginResult {
    pub connected: bool,
    pub message: String,
}

impl WaitLoginResult {
    fn linked() -> Self {
        Self {
            connected: true,
            message: MSG_LINKED.to_string(),
        }
    }

    fn not_connected(message: impl Into<String>) -> Self {
        Self {
            connected: false,
            message: message.into(),
        }
    }
}

/// Link state of one account, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatusReport {
    pub account_id: String,
    pub linked: bool,
    pub identity: Option<SelfIdentity>,
    pub pairing: Option<SessionSummary>,
    pub health: Option<health::ComponentHealth>,
}

enum FirstEvent {
    Qr(String),
    Settled(Option<Settlement>),
}

pub struct PairingService {
    registry: Arc<SessionRegistry>,
    config: PairingConfig,
    client: Arc<dyn ProtocolClient>,
    credentials: Arc<dyn CredentialStore>,
    renderer: Arc<dyn QrRenderer>,
}

impl PairingService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: PairingConfig,
        client: Arc<dyn ProtocolClient>,
        credentials: Arc<dyn CredentialStore>,
        renderer: Arc<dyn QrRenderer>,
    ) -> Self {
        Self {
            registry,
            config,
            client,
            credentials,
            renderer,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Normalized account id, falling back to the configured default.
    pub fn account_id(&self, account: Option<&str>) -> String {
        normalize_account_id(account.unwrap_or(&self.config.default_account))
    }

    /// Begin (or resume) a QR pairing attempt for `account`.
    pub async fn start_login(&self, account: &str, opts: StartLoginOptions) -> StartLoginResult {
        let account_id = normalize_account_id(account);
        let credential_dir = match self.config.credential_dir(&account_id) {
            Ok(dir) => dir,
            Err(err) => return StartLoginResult::message(format!("Failed to get a QR code: {err}")),
        };

        match self.credentials.exists(&credential_dir).await {
            Ok(true) if !opts.force => {
                let who = self.describe_identity(&credential_dir).await;
                return StartLoginResult::message(format!(
                    "WhatsApp is already linked{who}. Pass --force to relink."
                ));
            }
            Ok(true) => {
                self.registry.evict(&account_id);
                if let Err(err) = self.credentials.wipe(&credential_dir).await {
                    let err = PairingError::CredentialStore(format!("{err:#}"));
                    warn!(account = %account_id, error = %err, "pairing.relink_failed");
                    return StartLoginResult::message(format!("Failed to get a QR code: {err}"));
                }
                info!(account = %account_id, "pairing.relink");
            }
            Ok(false) => {}
            Err(err) => {
                let err = PairingError::CredentialStore(format!("{err:#}"));
                warn!(account = %account_id, error = %err, "pairing.credentials_unreadable");
                return StartLoginResult::message(format!("Failed to get a QR code: {err}"));
            }
        }

        if !opts.force {
            if let Some(qr) = self.reusable_qr(&account_id) {
                return StartLoginResult::qr(qr.data_url, qr.payload, MSG_QR_ACTIVE);
            }
        }

        self.registry.evict(&account_id);

        let (sink, qr_rx) = QrSink::new();
        let (signal, waiter) = waiter::arm();
        let request = OpenRequest {
            credential_dir: credential_dir.clone(),
            verbose: opts.verbose,
        };
        let handle = match self
            .client
            .open(request, ConnectionEvents::new(sink, signal))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                let err = PairingError::HandleOpen(format!("{err:#}"));
                warn!(account = %account_id, error = %err, "pairing.open_failed");
                health::mark_failed(&account_id, &err);
                return StartLoginResult::message(format!("Failed to get a QR code: {err}"));
            }
        };

        let session = PairingSession::new(
            account_id.as_str(),
            credential_dir.as_path(),
            opts.verbose,
            handle,
            waiter.clone(),
        );
        let session_id = session.session_id().to_string();
        self.registry.put(session);
        info!(account = %account_id, session = %session_id, "pairing.started");

        let qr_timeout = self.config.qr_timeout(opts.timeout_ms);
        match tokio::time::timeout(qr_timeout, first_event(qr_rx, &waiter)).await {
            Err(_) => {
                let err = PairingError::QrTimeout(qr_timeout);
                drop(self.registry.evict_if(&account_id, &session_id));
                warn!(account = %account_id, session = %session_id, "pairing.qr_timeout");
                health::mark_failed(&account_id, &err);
                StartLoginResult::message(format!("Failed to get a QR code: {err}"))
            }
            Ok(FirstEvent::Qr(payload)) => self.issue_qr(&account_id, &session_id, payload),
            Ok(FirstEvent::Settled(settled)) => {
                let owned = self.registry.evict_if(&account_id, &session_id);
                match settled {
                    Some(Settlement::Connected) => {
                        self.mark_linked(owned, &account_id);
                        StartLoginResult::message(MSG_LINKED)
                    }
                    Some(Settlement::Failed {
                        status_code,
                        message,
                    }) => StartLoginResult::message(
                        self.fail(owned, &account_id, status_code, message).await,
                    ),
                    None => {
                        warn!(account = %account_id, "pairing.closed_before_qr");
                        StartLoginResult::message(
                            "Failed to get a QR code: the connection closed before a QR code was issued.",
                        )
                    }
                }
            }
        }
    }

    /// Wait for the phone to finish linking the pending attempt for `account`.
    pub async fn wait_for_login(&self, account: &str, opts: WaitLoginOptions) -> WaitLoginResult {
        let account_id = normalize_account_id(account);
        let Some(view) = self.registry.get(&account_id) else {
            return WaitLoginResult::not_connected(MSG_NO_PAIRING);
        };
        let (mut session_id, mut waiter) = match self.follow(&account_id, view) {
            Ok(current) => current,
            Err(result) => return result,
        };

        let deadline = Instant::now() + self.config.wait_timeout(opts.timeout_ms);
        loop {
            let Ok(settled) = tokio::time::timeout_at(deadline, waiter.wait()).await else {
                debug!(account = %account_id, session = %session_id, "pairing.wait_timeout");
                return WaitLoginResult::not_connected(PairingError::WaitTimeout.to_string());
            };

            // A completion from a replaced session is discarded; keep waiting on
            // whatever is stored now.
            if let Some(current) = self.registry.get(&account_id) {
                if current.session_id != session_id {
                    debug!(account = %account_id, session = %session_id, "pairing.stale_completion");
                    (session_id, waiter) = match self.follow(&account_id, current) {
                        Ok(current) => current,
                        Err(result) => return result,
                    };
                    continue;
                }
            }

            match settled {
                Some(Settlement::Connected) => {
                    let owned = self.registry.evict_if(&account_id, &session_id);
                    self.mark_linked(owned, &account_id);
                    return WaitLoginResult::linked();
                }
                Some(Settlement::Failed {
                    status_code,
                    message,
                }) if DisconnectKind::classify(status_code) == DisconnectKind::RestartRequired => {
                    let policy = RestartPolicy::new(&self.registry, self.client.as_ref());
                    match policy.restart(&account_id, &session_id).await {
                        RestartOutcome::Reconnected {
                            session_id: new_id,
                            waiter: new_waiter,
                        } => {
                            health::bump_restart(&account_id);
                            if !self.registry.is_fresh(&account_id, &new_id) {
                                // The attempt aged out while reconnecting; the
                                // restart-required disconnect stands.
                                let owned = self.registry.evict_if(&account_id, &new_id);
                                return WaitLoginResult::not_connected(
                                    self.fail(owned, &account_id, status_code, message).await,
                                );
                            }
                            session_id = new_id;
                            waiter = new_waiter;
                        }
                        RestartOutcome::Superseded => match self.registry.get(&account_id) {
                            Some(current) => {
                                (session_id, waiter) = match self.follow(&account_id, current) {
                                    Ok(current) => current,
                                    Err(result) => return result,
                                };
                            }
                            None => return WaitLoginResult::not_connected(MSG_ENDED),
                        },
                        RestartOutcome::Exhausted => {
                            let owned = self.registry.evict_if(&account_id, &session_id);
                            return WaitLoginResult::not_connected(
                                self.fail(owned, &account_id, status_code, message).await,
                            );
                        }
                        RestartOutcome::ReopenFailed {
                            session_id: new_id,
                            error,
                        } => {
                            if self.registry.evict_if(&account_id, &new_id).is_some() {
                                health::mark_failed(&account_id, &error);
                            }
                            return WaitLoginResult::not_connected(format!(
                                "WhatsApp login failed: {error}"
                            ));
                        }
                    }
                }
                Some(Settlement::Failed {
                    status_code,
                    message,
                }) => {
                    let owned = self.registry.evict_if(&account_id, &session_id);
                    return WaitLoginResult::not_connected(
                        self.fail(owned, &account_id, status_code, message).await,
                    );
                }
                None => {
                    if self.registry.evict_if(&account_id, &session_id).is_some() {
                        warn!(account = %account_id, session = %session_id, "pairing.closed");
                        health::mark_failed(&account_id, MSG_ENDED);
                    }
                    return WaitLoginResult::not_connected(MSG_ENDED);
                }
            }
        }
    }

    /// Abort the pending attempt, closing its connection. Returns whether one existed.
    pub fn cancel_login(&self, account: &str) -> bool {
        let account_id = normalize_account_id(account);
        let cancelled = self.registry.evict(&account_id);
        if cancelled {
            info!(account = %account_id, "pairing.cancelled");
        }
        cancelled
    }

    /// Abort any attempt and wipe the stored credential. Returns whether a
    /// credential existed.
    pub async fn logout(&self, account: &str) -> anyhow::Result<bool> {
        let account_id = normalize_account_id(account);
        let credential_dir = self.config.credential_dir(&account_id)?;
        self.registry.evict(&account_id);

        let existed = self.credentials.exists(&credential_dir).await?;
        self.credentials.wipe(&credential_dir).await?;
        health::mark_unlinked(&account_id);
        info!(account = %account_id, existed, "pairing.logout");
        Ok(existed)
    }

    pub fn active_logins(&self) -> Vec<SessionSummary> {
        self.registry.snapshot()
    }

    pub async fn link_status(&self, account: &str) -> anyhow::Result<LinkStatusReport> {
        let account_id = normalize_account_id(account);
        let credential_dir = self.config.credential_dir(&account_id)?;
        let linked = self.credentials.exists(&credential_dir).await?;
        let identity = if linked {
            self.credentials.read_self_identity(&credential_dir).await.ok()
        } else {
            None
        };
        let pairing = self
            .registry
            .snapshot()
            .into_iter()
            .find(|summary| summary.account_id == account_id);

        Ok(LinkStatusReport {
            health: health::account(&account_id),
            account_id,
            linked,
            identity,
            pairing,
        })
    }

    fn reusable_qr(&self, account_id: &str) -> Option<IssuedQr> {
        let view = self.registry.get(account_id).filter(|view| view.fresh)?;
        debug!(account = %account_id, session = %view.session_id, "pairing.qr_reused");
        view.qr
    }

    /// Adopt the stored session if it is still fresh; an expired one is
    /// evicted and reported.
    fn follow(
        &self,
        account_id: &str,
        current: SessionView,
    ) -> Result<(String, ConnectionWaiter), WaitLoginResult> {
        if current.fresh {
            return Ok((current.session_id, current.waiter));
        }
        drop(self.registry.evict_if(account_id, &current.session_id));
        info!(account = %account_id, session = %current.session_id, "pairing.expired");
        Err(WaitLoginResult::not_connected(MSG_EXPIRED))
    }

    fn issue_qr(&self, account_id: &str, session_id: &str, payload: String) -> StartLoginResult {
        let data_url = match self.renderer.render(&payload) {
            Ok(png) => to_data_url(&png),
            Err(err) => {
                let err = PairingError::Render(format!("{err:#}"));
                drop(self.registry.evict_if(account_id, session_id));
                warn!(account = %account_id, error = %err, "pairing.render_failed");
                health::mark_failed(account_id, &err);
                return StartLoginResult::message(format!("Failed to get a QR code: {err}"));
            }
        };

        let issued = self.registry.update_if(account_id, session_id, |session| {
            session.issue_qr(payload, data_url).clone()
        });
        let Some(qr) = issued else {
            return StartLoginResult::message(MSG_CANCELLED);
        };

        info!(
            account = %account_id,
            session = %session_id,
            payload_len = qr.payload.len(),
            "pairing.qr_issued"
        );
        health::mark_pairing(account_id);
        StartLoginResult::qr(qr.data_url, qr.payload, MSG_SCAN)
    }

    /// Side effects of a successful link run only for the caller that
    /// evicted the session.
    fn mark_linked(&self, owned: Option<PairingSession>, account_id: &str) {
        let Some(session) = owned else {
            return;
        };
        health::mark_linked(account_id);
        info!(account = %account_id, session = %session.session_id(), "pairing.linked");
    }

    /// Settle a terminal provider failure and describe it. A logged-out
    /// status wipes the credential when `owned` is the evicted session.
    async fn fail(
        &self,
        owned: Option<PairingSession>,
        account_id: &str,
        status_code: Option<u16>,
        message: String,
    ) -> String {
        let err = PairingError::protocol(status_code, message);
        let kind = DisconnectKind::classify(status_code);

        if let Some(session) = owned {
            warn!(
                account = %account_id,
                session = %session.session_id(),
                status_code = ?status_code,
                kind = ?kind,
                "pairing.failed"
            );

            if kind == DisconnectKind::LoggedOut {
                if let Err(wipe_err) = self.credentials.wipe(session.credential_dir()).await {
                    let wipe_err = PairingError::CredentialStore(format!("{wipe_err:#}"));
                    warn!(account = %account_id, error = %wipe_err, "pairing.wipe_failed");
                    health::mark_failed(account_id, &wipe_err);
                    return format!(
                        "WhatsApp reported the session is logged out, but clearing the cached \
                         credential failed: {wipe_err}"
                    );
                }
                health::mark_unlinked(account_id);
            } else {
                health::mark_failed(account_id, &err);
            }
        }

        match kind {
            DisconnectKind::LoggedOut => MSG_LOGGED_OUT.to_string(),
            _ => format!("WhatsApp login failed: {err}"),
        }
    }

    async fn describe_identity(&self, credential_dir: &Path) -> String {
        match self.credentials.read_self_identity(credential_dir).await {
            Ok(identity) => identity
                .describe()
                .map(|who| format!(" as {who}"))
                .unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "pairing.identity_unreadable");
                String::new()
            }
        }
    }
}

/// First QR payload or an early settlement, whichever comes first.
async fn first_event(qr: oneshot::Receiver<String>, waiter: &ConnectionWaiter) -> FirstEvent {
    tokio::select! {
        biased;
        Ok(payload) = qr => FirstEvent::Qr(payload),
        settled = waiter.wait() => FirstEvent::Settled(settled),
    }
}
