//! Failure taxonomy for QR pairing attempts.
//!
//! Nothing in here crosses the public `start_login` / `wait_for_login`
//! boundary as an error value: the service converts every variant into a
//! human-readable result message.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Provider status code: the stored credential was revoked on the phone.
pub const STATUS_LOGGED_OUT: u16 = 401;

/// Provider status code: pairing succeeded but the transport must be reopened.
pub const STATUS_RESTART_REQUIRED: u16 = 515;

/// How a provider-side disconnect should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectKind {
    /// Terminal. The persisted credential must be wiped and the account re-paired.
    LoggedOut,
    /// Transient. One forced reconnect is allowed per session.
    RestartRequired,
    /// Terminal.
    Other,
}

impl DisconnectKind {
    pub fn classify(status_code: Option<u16>) -> Self {
        match status_code {
            Some(STATUS_LOGGED_OUT) => Self::LoggedOut,
            Some(STATUS_RESTART_REQUIRED) => Self::RestartRequired,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("could not open a WhatsApp connection: {0}")]
    HandleOpen(String),

    #[error("timed out after {}s waiting for a WhatsApp QR code", .0.as_secs())]
    QrTimeout(Duration),

    #[error("{message} ({})", status_label(.status_code))]
    Protocol {
        kind: DisconnectKind,
        status_code: Option<u16>,
        message: String,
    },

    #[error("Still waiting for the QR scan; poll again once it has been scanned.")]
    WaitTimeout,

    #[error("failed to render QR code: {0}")]
    Render(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),
}

impl PairingError {
    pub fn protocol(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind: DisconnectKind::classify(status_code),
            status_code,
            message: message.into(),
        }
    }
}

fn status_label(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("status={code}"),
        None => "status=unknown".to_string(),
    }
}
