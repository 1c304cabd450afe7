//! QR pairing flow tests.
//!
//! Drives `PairingService` against a scripted protocol client, an in-memory
//! credential store and a counting renderer. Timer races run on a paused
//! tokio clock so every deadline is deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use qrlink::config::PairingConfig;
use qrlink::health::{self, LinkStatus};
use qrlink::pairing::{
    ConnectionEvents, ConnectionHandle, CredentialStore, OpenRequest, PairingService,
    PairingState, ProtocolClient, QrRenderer, SESSION_TTL, SelfIdentity, SessionRegistry,
    StartLoginOptions, WaitLoginOptions,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

enum Script {
    /// Emit `qr-<n>` before `open` returns.
    EmitQr,
    /// Emit `qr-<n>` after a delay.
    EmitQrAfter(Duration),
    /// Never emit anything on its own.
    Silent,
    /// Suspend for a while before the handle exists, then stay silent.
    OpenAfter(Duration),
    FailOpen,
}

struct CountingHandle(Arc<AtomicUsize>);

impl ConnectionHandle for CountingHandle {
    fn close(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Opened {
    request: OpenRequest,
    events: ConnectionEvents,
    closes: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FakeClient {
    scripts: Mutex<VecDeque<Script>>,
    opened: Mutex<Vec<Opened>>,
}

impl FakeClient {
    fn script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    fn opens(&self) -> usize {
        self.opened.lock().len()
    }

    fn events(&self, index: usize) -> ConnectionEvents {
        self.opened.lock()[index].events.clone()
    }

    fn closes(&self, index: usize) -> usize {
        self.opened.lock()[index].closes.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> OpenRequest {
        self.opened.lock()[index].request.clone()
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn open(
        &self,
        request: OpenRequest,
        events: ConnectionEvents,
    ) -> anyhow::Result<Box<dyn ConnectionHandle>> {
        let script = self.scripts.lock().pop_front().unwrap_or(Script::EmitQr);
        match script {
            Script::FailOpen => anyhow::bail!("connection refused"),
            Script::OpenAfter(delay) => sleep(delay).await,
            _ => {}
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let payload = {
            let mut opened = self.opened.lock();
            opened.push(Opened {
                request,
                events: events.clone(),
                closes: closes.clone(),
            });
            format!("qr-{}", opened.len())
        };

        match script {
            Script::EmitQr => {
                events.qr(payload);
            }
            Script::EmitQrAfter(delay) => {
                tokio::spawn(async move {
                    sleep(delay).await;
                    events.qr(payload);
                });
            }
            Script::Silent | Script::OpenAfter(_) | Script::FailOpen => {}
        }
        Ok(Box::new(CountingHandle(closes)))
    }
}

#[derive(Default)]
struct MemoryCredentials {
    linked: Mutex<HashMap<PathBuf, SelfIdentity>>,
    wipes: AtomicUsize,
}

impl MemoryCredentials {
    fn link(&self, dir: &Path, identity: SelfIdentity) {
        self.linked.lock().insert(dir.to_path_buf(), identity);
    }

    fn is_linked(&self, dir: &Path) -> bool {
        self.linked.lock().contains_key(dir)
    }

    fn wipes(&self) -> usize {
        self.wipes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn exists(&self, credential_dir: &Path) -> anyhow::Result<bool> {
        Ok(self.is_linked(credential_dir))
    }

    async fn read_self_identity(&self, credential_dir: &Path) -> anyhow::Result<SelfIdentity> {
        self.linked
            .lock()
            .get(credential_dir)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no credential"))
    }

    async fn wipe(&self, credential_dir: &Path) -> anyhow::Result<()> {
        self.wipes.fetch_add(1, Ordering::SeqCst);
        self.linked.lock().remove(credential_dir);
        Ok(())
    }
}

#[derive(Default)]
struct CountingRenderer {
    renders: AtomicUsize,
}

impl QrRenderer for CountingRenderer {
    fn render(&self, payload: &str) -> anyhow::Result<String> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(format!("png({payload})"))
    }
}

struct Harness {
    client: Arc<FakeClient>,
    credentials: Arc<MemoryCredentials>,
    renderer: Arc<CountingRenderer>,
    service: PairingService,
}

impl Harness {
    fn new() -> Self {
        let config = PairingConfig {
            auth_dir: Some(PathBuf::from("/qrlink-test/credentials")),
            ..PairingConfig::default()
        };
        let client = Arc::new(FakeClient::default());
        let credentials = Arc::new(MemoryCredentials::default());
        let renderer = Arc::new(CountingRenderer::default());
        let service = PairingService::new(
            Arc::new(SessionRegistry::new(config.session_ttl())),
            config,
            client.clone(),
            credentials.clone(),
            renderer.clone(),
        );
        Self {
            client,
            credentials,
            renderer,
            service,
        }
    }

    fn dir(&self, account: &str) -> PathBuf {
        self.service.config().credential_dir(account).unwrap()
    }

    fn renders(&self) -> usize {
        self.renderer.renders.load(Ordering::SeqCst)
    }
}

fn wait_for(ms: u64) -> WaitLoginOptions {
    WaitLoginOptions {
        timeout_ms: Some(ms),
    }
}

fn alice() -> SelfIdentity {
    SelfIdentity {
        id: Some("15551234567:4@s.whatsapp.net".into()),
        display_id: Some("+15551234567".into()),
        name: Some("Alice".into()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// start_login
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn start_within_ttl_returns_same_qr_without_new_handle() {
    let h = Harness::new();

    let first = h
        .service
        .start_login("default", StartLoginOptions::default())
        .await;
    let second = h
        .service
        .start_login(" Default ", StartLoginOptions::default())
        .await;

    assert_eq!(first.qr_image.as_deref(), Some("data:image/png;base64,png(qr-1)"));
    assert_eq!(second.qr_image, first.qr_image);
    assert_eq!(second.qr_payload.as_deref(), Some("qr-1"));
    assert!(second.message.contains("already active"));
    assert_eq!(h.client.opens(), 1);
    assert_eq!(h.renders(), 1);
    assert_eq!(h.client.closes(0), 0);
}

#[tokio::test(start_paused = true)]
async fn start_after_ttl_opens_one_new_handle_and_closes_old_once() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    tokio::time::advance(SESSION_TTL).await;
    let fresh = h
        .service
        .start_login("default", StartLoginOptions::default())
        .await;

    assert_eq!(fresh.qr_payload.as_deref(), Some("qr-2"));
    assert_eq!(h.client.opens(), 2);
    assert_eq!(h.client.closes(0), 1);
    assert_eq!(h.client.closes(1), 0);
    assert_eq!(h.service.registry().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn qr_timeout_is_floored_and_leaves_no_session() {
    let h = Harness::new();
    h.client.script(Script::Silent);

    let started = Instant::now();
    let result = h
        .service
        .start_login(
            "default",
            StartLoginOptions {
                timeout_ms: Some(1_000),
                ..StartLoginOptions::default()
            },
        )
        .await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(5_000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5_100), "elapsed {elapsed:?}");
    assert!(result.qr_image.is_none());
    assert!(result.message.contains("timed out"), "{}", result.message);
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);

    // A QR after the timeout goes nowhere.
    assert!(!h.client.events(0).qr("late"));
}

#[tokio::test(start_paused = true)]
async fn open_failure_is_reported_as_message() {
    let h = Harness::new();
    h.client.script(Script::FailOpen);

    let result = h
        .service
        .start_login("default", StartLoginOptions::default())
        .await;

    assert!(result.qr_image.is_none());
    assert!(result.message.contains("connection refused"), "{}", result.message);
    assert!(h.service.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn already_linked_account_is_not_reopened() {
    let h = Harness::new();
    h.credentials.link(&h.dir("default"), alice());

    let result = h
        .service
        .start_login("default", StartLoginOptions::default())
        .await;

    assert!(result.qr_image.is_none());
    assert!(result.message.contains("already linked"), "{}", result.message);
    assert!(result.message.contains("+15551234567 (Alice)"));
    assert_eq!(h.client.opens(), 0);
    assert!(h.service.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn force_wipes_credential_and_relinks() {
    let h = Harness::new();
    h.credentials.link(&h.dir("default"), alice());

    let result = h
        .service
        .start_login(
            "default",
            StartLoginOptions {
                force: true,
                ..StartLoginOptions::default()
            },
        )
        .await;

    assert!(result.qr_image.is_some());
    assert_eq!(h.credentials.wipes(), 1);
    assert!(!h.credentials.is_linked(&h.dir("default")));
    assert_eq!(h.client.opens(), 1);
    assert_eq!(h.client.request(0).credential_dir, h.dir("default"));
}

#[tokio::test(start_paused = true)]
async fn force_replaces_an_active_qr() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;
    let forced = h
        .service
        .start_login(
            "default",
            StartLoginOptions {
                force: true,
                verbose: true,
                ..StartLoginOptions::default()
            },
        )
        .await;

    assert_eq!(forced.qr_payload.as_deref(), Some("qr-2"));
    assert_eq!(h.client.closes(0), 1);
    assert!(h.client.request(1).verbose);
}

#[tokio::test(start_paused = true)]
async fn logged_out_before_qr_wipes_and_asks_for_repair() {
    let h = Harness::new();
    h.client.script(Script::Silent);
    let dir = h.dir("early-401");

    let start = h
        .service
        .start_login("early-401", StartLoginOptions::default());
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.credentials.link(&dir, SelfIdentity::default());
        h.client.events(0).failed(Some(401), "logged out");
    };
    let (result, ()) = tokio::join!(start, drive);

    assert!(result.qr_image.is_none());
    assert!(result.message.contains("logged out"), "{}", result.message);
    assert_eq!(h.credentials.wipes(), 1);
    assert!(!h.credentials.is_linked(&dir));
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn connected_before_qr_reports_linked() {
    let h = Harness::new();
    h.client.script(Script::Silent);

    let start = h.service.start_login("early-ok", StartLoginOptions::default());
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).connected();
    };
    let (result, ()) = tokio::join!(start, drive);

    assert!(result.message.starts_with("Linked!"));
    assert!(h.service.registry().is_empty());
    assert_eq!(
        health::account("early-ok").map(|c| c.status),
        Some(LinkStatus::Linked)
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_account_id_is_rejected() {
    let h = Harness::new();
    let result = h
        .service
        .start_login("../escape", StartLoginOptions::default())
        .await;
    assert!(result.qr_image.is_none());
    assert!(result.message.contains("Account id"), "{}", result.message);
    assert_eq!(h.client.opens(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// wait_for_login
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn wait_without_session_reports_nothing_pending() {
    let h = Harness::new();
    let result = h.service.wait_for_login("default", wait_for(1_000)).await;
    assert!(!result.connected);
    assert!(result.message.contains("No pairing in progress"));
}

#[tokio::test(start_paused = true)]
async fn connected_evicts_and_rewait_finds_nothing() {
    let h = Harness::new();
    h.service
        .start_login("linked-once", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("linked-once", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(50)).await;
        h.client.events(0).connected();
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(result.connected);
    assert_eq!(result.message, "Linked! WhatsApp is ready.");
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
    assert_eq!(
        health::account("linked-once").map(|c| c.status),
        Some(LinkStatus::Linked)
    );

    let again = h.service.wait_for_login("linked-once", wait_for(1_000)).await;
    assert!(!again.connected);
    assert!(again.message.contains("No pairing in progress"));
}

#[tokio::test(start_paused = true)]
async fn still_waiting_then_linked_on_later_poll() {
    let h = Harness::new();
    h.client.script(Script::EmitQrAfter(Duration::from_millis(100)));
    let t0 = Instant::now();

    let started = h
        .service
        .start_login("default", StartLoginOptions::default())
        .await;
    assert_eq!(started.qr_payload.as_deref(), Some("qr-1"));
    assert_eq!(t0.elapsed(), Duration::from_millis(100));

    sleep(Duration::from_millis(100)).await;
    let pending = h.service.wait_for_login("default", wait_for(5_000)).await;
    assert_eq!(t0.elapsed(), Duration::from_millis(5_200));
    assert!(!pending.connected);
    assert!(pending.message.contains("Still waiting"), "{}", pending.message);
    assert!(h.service.registry().contains("default"));
    assert_eq!(h.client.closes(0), 0);

    tokio::time::sleep_until(t0 + Duration::from_millis(6_000)).await;
    h.client.events(0).connected();

    let linked = h.service.wait_for_login("default", wait_for(5_000)).await;
    assert!(linked.connected);
    assert!(h.service.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn wait_on_expired_session_evicts_it() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    tokio::time::advance(SESSION_TTL).await;
    let result = h.service.wait_for_login("default", wait_for(1_000)).await;

    assert!(!result.connected);
    assert!(result.message.contains("expired"), "{}", result.message);
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_required_reconnects_then_links() {
    let h = Harness::new();
    h.service
        .start_login("restart-ok", StartLoginOptions::default())
        .await;
    let original_id = h.service.registry().session_id("restart-ok").unwrap();

    let wait = h.service.wait_for_login("restart-ok", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.client.opens(), 2);
        assert_ne!(
            h.service.registry().session_id("restart-ok"),
            Some(original_id.clone())
        );
        h.client.events(1).connected();
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(result.connected, "{}", result.message);
    assert_eq!(h.client.request(1).credential_dir, h.dir("restart-ok"));
    assert_eq!(h.client.closes(0), 1);
    assert_eq!(h.client.closes(1), 1);
    assert!(h.service.registry().is_empty());
    assert_eq!(health::account("restart-ok").unwrap().restart_count, 1);
}

#[tokio::test(start_paused = true)]
async fn second_restart_required_is_terminal() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("default", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
        sleep(Duration::from_millis(10)).await;
        h.client.events(1).failed(Some(515), "restart required again");
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(!result.connected);
    assert!(result.message.contains("status=515"), "{}", result.message);
    assert_eq!(h.client.opens(), 2);
    assert_eq!(h.client.closes(1), 1);
    assert!(h.service.registry().is_empty());
    assert_eq!(h.credentials.wipes(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_reopen_failure_is_terminal() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;
    h.client.script(Script::FailOpen);

    let wait = h.service.wait_for_login("default", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(!result.connected);
    assert!(result.message.contains("connection refused"), "{}", result.message);
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_outliving_ttl_fails_with_restart_status() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;
    h.client.script(Script::OpenAfter(SESSION_TTL));

    let wait = h.service.wait_for_login("default", wait_for(600_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(!result.connected);
    assert_eq!(
        result.message,
        "WhatsApp login failed: restart required (status=515)"
    );
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.opens(), 2);
    assert_eq!(h.client.closes(0), 1);
    assert_eq!(h.client.closes(1), 1);
}

#[tokio::test(start_paused = true)]
async fn logged_out_wipes_credential_and_evicts() {
    let h = Harness::new();
    let dir = h.dir("revoked");
    h.service
        .start_login("revoked", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("revoked", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.credentials.link(&dir, SelfIdentity::default());
        h.client.events(0).failed(Some(401), "logged out");
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(!result.connected);
    assert!(result.message.contains("logged out"), "{}", result.message);
    assert!(result.message.contains("fresh QR"));
    assert_eq!(h.credentials.wipes(), 1);
    assert!(!h.credentials.is_linked(&dir));
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.opens(), 1);
    assert_eq!(
        health::account("revoked").map(|c| c.status),
        Some(LinkStatus::Unlinked)
    );
}

#[tokio::test(start_paused = true)]
async fn other_failure_is_generic_and_keeps_credential() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("default", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(428), "connection closed");
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(!result.connected);
    assert_eq!(
        result.message,
        "WhatsApp login failed: connection closed (status=428)"
    );
    assert_eq!(h.credentials.wipes(), 0);
    assert!(h.service.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_ends_without_connecting() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;
    // The client forgets every copy of the connection's events.
    h.client.opened.lock()[0].events = ConnectionEvents::new(
        qrlink::pairing::QrSink::detached(),
        qrlink::pairing::waiter::arm().0,
    );

    let result = h.service.wait_for_login("default", wait_for(60_000)).await;
    assert!(!result.connected);
    assert!(result.message.contains("ended without connecting"));
    assert!(h.service.registry().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_waits_both_observe_connected() {
    let h = Harness::new();
    h.service
        .start_login("fanout", StartLoginOptions::default())
        .await;

    let first = h.service.wait_for_login("fanout", wait_for(60_000));
    let second = h.service.wait_for_login("fanout", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).connected();
    };
    let (a, b, ()) = tokio::join!(first, second, drive);

    assert!(a.connected && b.connected);
    assert_eq!(a.message, b.message);
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waits_follow_single_reconnect() {
    let h = Harness::new();
    h.service
        .start_login("fanout-515", StartLoginOptions::default())
        .await;
    h.client.script(Script::OpenAfter(Duration::from_millis(50)));

    let first = h.service.wait_for_login("fanout-515", wait_for(60_000));
    let second = h.service.wait_for_login("fanout-515", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.opens(), 2);
        h.client.events(1).connected();
    };
    let (a, b, ()) = tokio::join!(first, second, drive);

    assert!(a.connected, "{}", a.message);
    assert!(b.connected, "{}", b.message);
    assert_eq!(h.client.opens(), 2);
    assert_eq!(h.client.closes(0), 1);
    assert_eq!(h.client.closes(1), 1);
    assert!(h.service.registry().is_empty());
    assert_eq!(health::account("fanout-515").unwrap().restart_count, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waits_share_one_failed_reconnect() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;
    h.client.script(Script::FailOpen);

    let first = h.service.wait_for_login("default", wait_for(60_000));
    let second = h.service.wait_for_login("default", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(515), "restart required");
    };
    let (a, b, ()) = tokio::join!(first, second, drive);

    assert!(!a.connected && !b.connected);
    assert!(
        a.message.contains("connection refused") || b.message.contains("connection refused"),
        "{} / {}",
        a.message,
        b.message
    );
    assert!(!a.message.contains("status=515") && !b.message.contains("status=515"));
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn status_reports_link_once_phone_confirms() {
    let h = Harness::new();
    h.service
        .start_login("confirmed", StartLoginOptions::default())
        .await;
    h.client.events(0).connected();

    let report = h.service.link_status("confirmed").await.unwrap();
    assert_eq!(
        report.pairing.map(|summary| summary.state),
        Some(PairingState::Connected)
    );

    let linked = h.service.wait_for_login("confirmed", wait_for(1_000)).await;
    assert!(linked.connected);
    let report = h.service.link_status("confirmed").await.unwrap();
    assert!(report.pairing.is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_waits_wipe_logged_out_credential_once() {
    let h = Harness::new();
    let dir = h.dir("fanout-401");
    h.service
        .start_login("fanout-401", StartLoginOptions::default())
        .await;
    h.credentials.link(&dir, SelfIdentity::default());

    let first = h.service.wait_for_login("fanout-401", wait_for(60_000));
    let second = h.service.wait_for_login("fanout-401", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(0).failed(Some(401), "logged out");
    };
    let (a, b, ()) = tokio::join!(first, second, drive);

    assert!(!a.connected && !b.connected);
    assert!(a.message.contains("logged out"));
    assert!(b.message.contains("logged out"));
    assert_eq!(h.credentials.wipes(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_completion_is_discarded_for_newer_session() {
    let h = Harness::new();
    let dir = h.dir("default");
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("default", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        let replaced = h
            .service
            .start_login(
                "default",
                StartLoginOptions {
                    force: true,
                    ..StartLoginOptions::default()
                },
            )
            .await;
        assert_eq!(replaced.qr_payload.as_deref(), Some("qr-2"));

        // The old socket reports a revoked credential after it was replaced.
        h.credentials.link(&dir, SelfIdentity::default());
        h.client.events(0).failed(Some(401), "old socket");
        sleep(Duration::from_millis(10)).await;
        h.client.events(1).connected();
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(result.connected, "{}", result.message);
    assert_eq!(h.credentials.wipes(), 0);
    assert!(h.credentials.is_linked(&dir));
    assert_eq!(h.client.closes(0), 1);
}

#[tokio::test(start_paused = true)]
async fn accounts_pair_independently() {
    let h = Harness::new();
    h.service
        .start_login("personal", StartLoginOptions::default())
        .await;
    h.service
        .start_login("work", StartLoginOptions::default())
        .await;

    let wait = h.service.wait_for_login("work", wait_for(60_000));
    let drive = async {
        sleep(Duration::from_millis(10)).await;
        h.client.events(1).connected();
    };
    let (result, ()) = tokio::join!(wait, drive);

    assert!(result.connected);
    assert!(h.service.registry().contains("personal"));
    assert!(!h.service.registry().contains("work"));
    assert_eq!(h.client.closes(0), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// cancel / logout / status
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancel_closes_pending_attempt() {
    let h = Harness::new();
    h.service
        .start_login("default", StartLoginOptions::default())
        .await;

    assert!(h.service.cancel_login("default"));
    assert!(!h.service.cancel_login("default"));
    assert_eq!(h.client.closes(0), 1);

    let result = h.service.wait_for_login("default", wait_for(1_000)).await;
    assert!(result.message.contains("No pairing in progress"));
}

#[tokio::test(start_paused = true)]
async fn logout_wipes_credential() {
    let h = Harness::new();
    h.credentials.link(&h.dir("default"), alice());

    assert!(h.service.logout("default").await.unwrap());
    assert!(!h.credentials.is_linked(&h.dir("default")));
    assert!(!h.service.logout("default").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn status_reports_identity_and_pending_attempts() {
    let h = Harness::new();
    h.credentials.link(&h.dir("default"), alice());
    h.service
        .start_login("status-pending", StartLoginOptions::default())
        .await;

    let linked = h.service.link_status("default").await.unwrap();
    assert!(linked.linked);
    assert_eq!(linked.identity.unwrap().name.as_deref(), Some("Alice"));
    assert!(linked.pairing.is_none());

    let pending = h.service.link_status("status-pending").await.unwrap();
    assert!(!pending.linked);
    assert_eq!(pending.pairing.unwrap().state, PairingState::QrIssued);
    assert_eq!(
        pending.health.map(|c| c.status),
        Some(LinkStatus::Pairing)
    );

    let active = h.service.active_logins();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].account_id, "status-pending");
}

#[tokio::test(start_paused = true)]
async fn login_commands_drive_the_service() {
    use qrlink::LoginCommands;
    use qrlink::pairing::handle_command;

    let h = Harness::new();
    handle_command(
        LoginCommands::Start {
            account: Some("cli".into()),
            force: false,
            timeout_ms: None,
            verbose: false,
        },
        &h.service,
    )
    .await
    .unwrap();
    assert!(h.service.registry().contains("cli"));

    handle_command(
        LoginCommands::Wait {
            account: Some("cli".into()),
            timeout_ms: Some(1_000),
        },
        &h.service,
    )
    .await
    .unwrap();
    assert!(h.service.registry().contains("cli"));

    handle_command(
        LoginCommands::Status {
            account: Some("cli".into()),
        },
        &h.service,
    )
    .await
    .unwrap();

    handle_command(
        LoginCommands::Cancel {
            account: Some("cli".into()),
        },
        &h.service,
    )
    .await
    .unwrap();
    assert!(h.service.registry().is_empty());
    assert_eq!(h.client.closes(0), 1);

    handle_command(LoginCommands::Logout { account: None }, &h.service)
        .await
        .unwrap();
}
