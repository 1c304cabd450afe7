#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::ref_option,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod health;
pub mod pairing;

pub use config::Config;
pub use pairing::{
    PairingService, SessionRegistry, StartLoginOptions, StartLoginResult, WaitLoginOptions,
    WaitLoginResult,
};

/// WhatsApp login subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoginCommands {
    /// Open a pairing attempt and print the QR code to scan
    Start {
        /// Account id (defaults to config pairing.default_account)
        #[arg(long)]
        account: Option<String>,
        /// Relink even if a credential already exists
        #[arg(long)]
        force: bool,
        /// How long to wait for the first QR code, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Ask the protocol client for verbose connection logs
        #[arg(long)]
        verbose: bool,
    },
    /// Wait for the phone to confirm a pending pairing attempt
    Wait {
        /// Account id (defaults to config pairing.default_account)
        #[arg(long)]
        account: Option<String>,
        /// Poll window in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Abort the pending pairing attempt and close its connection
    Cancel {
        #[arg(long)]
        account: Option<String>,
    },
    /// Abort any attempt and wipe the stored credential
    Logout {
        #[arg(long)]
        account: Option<String>,
    },
    /// Show link status and active pairing attempts
    Status {
        #[arg(long)]
        account: Option<String>,
    },
}

/// Install the global tracing subscriber - respects RUST_LOG, defaults to INFO.
pub fn init_logging() -> anyhow::Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))
}
