pub mod schema;

pub use schema::{
    Config, MIN_QR_TIMEOUT_MS, PairingConfig, normalize_account_id, validate_account_id,
};
