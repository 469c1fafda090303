//! Account credentials and HMAC-SHA256 request signing
//!
//! The secret is held in a `SecretString`, which redacts it from `Debug`
//! output and zeroes it on drop.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// API key and secret for one account
#[derive(Clone)]
pub struct ApiCredentials {
    api_key: String,
    secret_key: SecretString,
}

impl ApiCredentials {
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key,
            secret_key: SecretString::from(secret_key),
        }
    }

    /// Get the API key (public, safe to log).
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Only for signing. Never log the return value.
    pub fn expose_secret(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Signs Binance request payloads
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: ApiCredentials,
}

impl RequestSigner {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self { credentials }
    }

    pub fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    /// Hex-encoded HMAC-SHA256 of `message`
    pub fn sign(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.expose_secret().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Add `apiKey` and `timestamp`, then append a `signature` over the
    /// alphabetically sorted `key=value&...` payload.
    pub fn sign_params(
        &self,
        mut params: BTreeMap<String, String>,
        timestamp_ms: i64,
    ) -> BTreeMap<String, String> {
        params.insert("apiKey".to_string(), self.api_key().to_string());
        params.insert("timestamp".to_string(), timestamp_ms.to_string());

        let signature = self.sign(&query_string(&params));
        params.insert("signature".to_string(), signature);
        params
    }
}

/// `key=value` pairs joined by `&`, in key order
pub fn query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
