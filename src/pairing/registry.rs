//! Account id → active pairing attempt.
//!
//! At most one session is stored per account. Replacing or removing a
//! session drops it inside the critical section, and dropping a session
//! closes its connection handle, so swap-and-close is atomic. No lock is
//! ever held across an `.await`.

use super::session::{IssuedQr, PairingSession, SessionSummary};
use super::waiter::ConnectionWaiter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Point-in-time copy of the parts of a session callers race on.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: String,
    pub fresh: bool,
    pub qr: Option<IssuedQr>,
    pub waiter: ConnectionWaiter,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, PairingSession>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, account_id: &str) -> Option<SessionView> {
        let now = Instant::now();
        self.sessions.lock().get(account_id).map(|session| SessionView {
            session_id: session.session_id().to_string(),
            fresh: session.is_fresh(self.ttl, now),
            qr: session.qr().cloned(),
            waiter: session.waiter(),
        })
    }

    pub fn session_id(&self, account_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(account_id)
            .map(|session| session.session_id().to_string())
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.sessions.lock().contains_key(account_id)
    }

    /// Whether `session_id` is still the stored session and inside its TTL.
    pub fn is_fresh(&self, account_id: &str, session_id: &str) -> bool {
        let now = Instant::now();
        self.sessions
            .lock()
            .get(account_id)
            .is_some_and(|session| {
                session.session_id() == session_id && session.is_fresh(self.ttl, now)
            })
    }

    /// Store `session`, closing the handle of whatever it replaces.
    /// Returns `true` if a previous session was replaced.
    pub fn put(&self, session: PairingSession) -> bool {
        let account_id = session.account_id().to_string();
        let mut sessions = self.sessions.lock();
        let replaced = sessions.insert(account_id.clone(), session);
        let was_replaced = replaced.is_some();
        drop(replaced);
        drop(sessions);

        if was_replaced {
            debug!(account = %account_id, "pairing.session_replaced");
        }
        was_replaced
    }

    /// Remove the account's session and close its handle.
    pub fn evict(&self, account_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let removed = sessions.remove(account_id);
        let was_removed = removed.is_some();
        drop(removed);
        drop(sessions);

        if was_removed {
            debug!(account = %account_id, "pairing.session_evicted");
        }
        was_removed
    }

    /// Remove the account's session only if it is still `session_id`.
    ///
    /// The handle is closed before returning; the caller gets the record back
    /// to settle its outcome.
    pub fn evict_if(&self, account_id: &str, session_id: &str) -> Option<PairingSession> {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(account_id)
            .is_none_or(|session| session.session_id() != session_id)
        {
            return None;
        }
        let mut removed = sessions.remove(account_id)?;
        removed.close_handle();
        drop(sessions);

        debug!(account = %account_id, session = %session_id, "pairing.session_evicted");
        Some(removed)
    }

    /// Run `f` against the stored session if it is still `session_id`.
    pub fn update_if<R>(
        &self,
        account_id: &str,
        session_id: &str,
        f: impl FnOnce(&mut PairingSession) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(account_id)
            .filter(|session| session.session_id() == session_id)?;
        Some(f(session))
    }

    /// Summaries of every stored attempt, expired ones included.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let now = Instant::now();
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .lock()
            .values()
            .map(|session| session.summary(self.ttl, now))
            .collect();
        summaries.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
