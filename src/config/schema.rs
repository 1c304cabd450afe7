use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lower bound for the open-timeout; providers take a few seconds to emit
/// the first QR even on fast links.
pub const MIN_QR_TIMEOUT_MS: u64 = 5_000;

const MAX_ACCOUNT_ID_LEN: usize = 64;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory (~/.qrlink) - computed from home, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub pairing: PairingConfig,
}

// ── Pairing ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// How long a pairing attempt (and its QR) stays usable
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// How long to wait for the provider's first QR code (floored at 5000)
    #[serde(default = "default_qr_timeout_ms")]
    pub qr_timeout_ms: u64,
    /// Default poll window for `wait`
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Root for per-account credential directories
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    /// Account used when none is given
    #[serde(default = "default_account")]
    pub default_account: String,
}

fn default_session_ttl_ms() -> u64 {
    180_000
}

fn default_qr_timeout_ms() -> u64 {
    30_000
}

fn default_wait_timeout_ms() -> u64 {
    120_000
}

fn default_account() -> String {
    "default".into()
}

fn default_data_dir() -> PathBuf {
    let home =
        UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
    home.join(".qrlink")
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: default_session_ttl_ms(),
            qr_timeout_ms: default_qr_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            auth_dir: None,
            default_account: default_account(),
        }
    }
}

impl PairingConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    /// Open-timeout for a `start` call, honouring the per-call override and
    /// the 5s floor.
    pub fn qr_timeout(&self, override_ms: Option<u64>) -> Duration {
        let ms = override_ms.unwrap_or(self.qr_timeout_ms);
        Duration::from_millis(ms.max(MIN_QR_TIMEOUT_MS))
    }

    pub fn wait_timeout(&self, override_ms: Option<u64>) -> Duration {
        Duration::from_millis(override_ms.unwrap_or(self.wait_timeout_ms))
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.auth_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("credentials").join("whatsapp"))
    }

    /// `<auth_dir>/<account>`; rejects ids that could escape `auth_dir`.
    pub fn credential_dir(&self, account_id: &str) -> Result<PathBuf> {
        validate_account_id(account_id)?;
        Ok(self.auth_dir().join(account_id))
    }
}

/// Trim and lowercase; an empty id means `default`.
pub fn normalize_account_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return default_account();
    }
    trimmed.to_ascii_lowercase()
}

pub fn validate_account_id(account_id: &str) -> Result<()> {
    if account_id.is_empty() || account_id.len() > MAX_ACCOUNT_ID_LEN {
        anyhow::bail!("Account id must be 1-{MAX_ACCOUNT_ID_LEN} characters");
    }
    if !account_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!("Account id `{account_id}` may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();

        Self {
            config_path: data_dir.join("config.toml"),
            data_dir,
            pairing: PairingConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let mut config = Self::load_or_init_in(&home.join(".qrlink"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `<data_dir>/config.toml`, writing defaults first if it is missing.
    pub fn load_or_init_in(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).context("Failed to create .qrlink directory")?;
        }

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            Config::default()
        };

        // Set computed paths that are skipped during serialization
        config.config_path = config_path;
        config.data_dir = data_dir.to_path_buf();
        if config.pairing.auth_dir.is_none() {
            config.pairing.auth_dir = Some(data_dir.join("credentials").join("whatsapp"));
        }

        if !config.config_path.exists() {
            config.save()?;
        }
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Credential root: QRLINK_AUTH_DIR
        if let Some(dir) = lookup("QRLINK_AUTH_DIR") {
            self.pairing.auth_dir = Some(PathBuf::from(dir));
        }

        // Open-timeout: QRLINK_QR_TIMEOUT_MS
        if let Some(ms) = lookup("QRLINK_QR_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.pairing.qr_timeout_ms = ms;
        }

        // Default account: QRLINK_ACCOUNT
        if let Some(account) = lookup("QRLINK_ACCOUNT") {
            self.pairing.default_account = normalize_account_id(&account);
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
