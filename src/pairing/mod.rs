//! QR device pairing for WhatsApp linked devices.
//!
//! A [`PairingService`] drives one pairing attempt per account:
//! `start_login` opens a provider connection and hands back the first QR,
//! `wait_for_login` waits for the phone to confirm. Attempts live in an
//! explicit [`SessionRegistry`] and expire lazily after their TTL.
//!
//! The wire protocol, credential persistence and QR rendering sit behind
//! [`ProtocolClient`], [`CredentialStore`] and [`QrRenderer`].

pub mod client;
pub mod credentials;
pub mod error;
pub mod qr;
pub mod registry;
pub mod restart;
pub mod service;
pub mod session;
pub mod waiter;

pub use client::{ConnectionEvents, ConnectionHandle, OpenRequest, ProtocolClient, QrSink};
pub use credentials::{CredentialStore, FsCredentialStore, SelfIdentity, jid_to_e164};
pub use error::{DisconnectKind, PairingError, STATUS_LOGGED_OUT, STATUS_RESTART_REQUIRED};
pub use qr::{PngQrRenderer, QrRenderer, render_terminal, to_data_url};
pub use registry::{SessionRegistry, SessionView};
pub use restart::{RestartOutcome, RestartPolicy, RestartToken};
pub use service::{
    LinkStatusReport, PairingService, StartLoginOptions, StartLoginResult, WaitLoginOptions,
    WaitLoginResult,
};
pub use session::{IssuedQr, Outcome, PairingSession, PairingState, SESSION_TTL, SessionSummary};
pub use waiter::{ConnectionSignal, ConnectionWaiter, Settlement};

use crate::LoginCommands;
use anyhow::Result;

pub async fn handle_command(command: LoginCommands, service: &PairingService) -> Result<()> {
    match command {
        LoginCommands::Start {
            account,
            force,
            timeout_ms,
            verbose,
        } => {
            let account_id = service.account_id(account.as_deref());
            let result = service
                .start_login(
                    &account_id,
                    StartLoginOptions {
                        force,
                        timeout_ms,
                        verbose,
                    },
                )
                .await;

            if let Some(payload) = result.qr_payload.as_deref() {
                match render_terminal(payload) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => tracing::warn!(error = %err, "pairing.terminal_render_failed"),
                }
            }
            println!("📱 [{account_id}] {}", result.message);
            if result.qr_image.is_some() {
                println!("\nNext:");
                println!("  qrlink login wait --account {account_id}");
            }
            Ok(())
        }
        LoginCommands::Wait {
            account,
            timeout_ms,
        } => {
            let account_id = service.account_id(account.as_deref());
            let result = service
                .wait_for_login(&account_id, WaitLoginOptions { timeout_ms })
                .await;
            let marker = if result.connected { "✅" } else { "⏳" };
            println!("{marker} [{account_id}] {}", result.message);
            Ok(())
        }
        LoginCommands::Cancel { account } => {
            let account_id = service.account_id(account.as_deref());
            if service.cancel_login(&account_id) {
                println!("🛑 Cancelled pairing for {account_id}");
            } else {
                println!("No pairing in progress for {account_id}");
            }
            Ok(())
        }
        LoginCommands::Logout { account } => {
            let account_id = service.account_id(account.as_deref());
            if service.logout(&account_id).await? {
                println!("🚪 Logged out {account_id}; the linked device credential was removed.");
            } else {
                println!("{account_id} was not linked.");
            }
            Ok(())
        }
        LoginCommands::Status { account } => {
            let account_id = service.account_id(account.as_deref());
            let report = service.link_status(&account_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            let others: Vec<_> = service
                .active_logins()
                .into_iter()
                .filter(|summary| summary.account_id != account_id)
                .collect();
            if !others.is_empty() {
                println!("\nOther pairing attempts ({}):", others.len());
                for summary in others {
                    println!(
                        "- {} | {:?} | age={}ms",
                        summary.account_id, summary.state, summary.age_ms
                    );
                }
            }
            Ok(())
        }
    }
}
