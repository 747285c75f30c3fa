//! Request signing for centralized exchanges
//!
//! - Binance: hex(HMAC-SHA256(secret, query_string))
//! - KuCoin: base64(HMAC-SHA256(secret, timestamp + method + endpoint + body)),
//!   passphrase signed the same way (API key version 2)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hmac_sha256(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Binance SIGNED endpoint signature
pub fn binance_signature(secret: &str, query: &str) -> String {
    hex::encode(hmac_sha256(secret.as_bytes(), query.as_bytes()))
}

/// KuCoin request headers
pub struct KuCoinHeaders {
    pub timestamp: String,
    pub signature: String,
    pub passphrase: String,
}

pub fn kucoin_headers(
    secret: &str,
    passphrase: &str,
    timestamp: u64,
    method: &str,
    endpoint: &str,
    body: &str,
) -> KuCoinHeaders {
    let payload = format!("{}{}{}{}", timestamp, method.to_uppercase(), endpoint, body);
    KuCoinHeaders {
        timestamp: timestamp.to_string(),
        signature: BASE64.encode(hmac_sha256(secret.as_bytes(), payload.as_bytes())),
        passphrase: BASE64.encode(hmac_sha256(secret.as_bytes(), passphrase.as_bytes())),
    }
}
