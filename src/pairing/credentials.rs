//! Persisted linked-device credentials.
//!
//! The core only needs three questions answered: is the account linked,
//! who is it linked as, and wipe it. [`FsCredentialStore`] answers them for
//! the usual layout where the provider client keeps a `creds.json` inside the
//! account's credential directory. Everything else in that directory is
//! opaque here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

const CREDS_FILE: &str = "creds.json";

/// Who a stored credential belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfIdentity {
    /// Raw JID, e.g. `15551234567:12@s.whatsapp.net`.
    pub id: Option<String>,
    /// E.164 number derived from the JID, e.g. `+15551234567`.
    pub display_id: Option<String>,
    /// Push name the phone reported.
    pub name: Option<String>,
}

impl SelfIdentity {
    /// `+15551234567 (Alice)`, or whatever subset is known.
    pub fn describe(&self) -> Option<String> {
        let who = self.display_id.as_deref().or(self.id.as_deref());
        match (who, self.name.as_deref()) {
            (Some(who), Some(name)) => Some(format!("{who} ({name})")),
            (Some(who), None) => Some(who.to_string()),
            (None, Some(name)) => Some(name.to_string()),
            (None, None) => None,
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn exists(&self, credential_dir: &Path) -> Result<bool>;

    async fn read_self_identity(&self, credential_dir: &Path) -> Result<SelfIdentity>;

    async fn wipe(&self, credential_dir: &Path) -> Result<()>;
}

/// Directory-per-account store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCredentialStore;

#[derive(Debug, Deserialize)]
struct CredsFile {
    #[serde(default)]
    me: Option<MeRecord>,
}

#[derive(Debug, Deserialize)]
struct MeRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn exists(&self, credential_dir: &Path) -> Result<bool> {
        match tokio::fs::metadata(credential_dir.join(CREDS_FILE)).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "Failed to inspect credentials in {}",
                    credential_dir.display()
                )
            }),
        }
    }

    async fn read_self_identity(&self, credential_dir: &Path) -> Result<SelfIdentity> {
        let path = credential_dir.join(CREDS_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let creds: CredsFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let Some(me) = creds.me else {
            return Ok(SelfIdentity::default());
        };
        Ok(SelfIdentity {
            display_id: me.id.as_deref().and_then(jid_to_e164),
            id: me.id,
            name: me.name.filter(|n| !n.trim().is_empty()),
        })
    }

    async fn wipe(&self, credential_dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(credential_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("Failed to wipe credentials in {}", credential_dir.display())
            }),
        }
    }
}

/// Phone-number JID to E.164. `15551234567:12@s.whatsapp.net` → `+15551234567`.
///
/// LID and group JIDs carry no phone number and yield `None`.
pub fn jid_to_e164(jid: &str) -> Option<String> {
    let (user, server) = jid.trim().split_once('@')?;
    if server != "s.whatsapp.net" && server != "c.us" {
        return None;
    }
    let number = user.split([':', '.']).next().unwrap_or(user);
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{number}"))
}
