use once_cell::sync::OnceCell;
use rand::Rng;
use rand::RngCore;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use reqwest::Client;
use std::time::Duration;

use crate::error::{LeaseError, Result};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Shared HTTP client. Per-request timeouts are applied by callers.
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|err| LeaseError::Transport(format!("Failed to build HTTP client: {err}")))
    })
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Alphanumeric login password for a freshly provisioned sandbox.
pub fn generate_password(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
