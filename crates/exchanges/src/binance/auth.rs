//! Binance authentication and request signing
//!
//! - Credentials loaded once from `PUBLIC_KEY` / `SECRET_KEY`
//! - Parameters kept in insertion order and form-URL-encoded
//! - HMAC-SHA256 over the encoded query, hex signature appended last

use crate::errors::{ExchangeError, Result};
use futlink_core::PerfTimer;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

pub const PUBLIC_KEY_VAR: &str = "PUBLIC_KEY";
pub const SECRET_KEY_VAR: &str = "SECRET_KEY";

/// Binance API credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    public_key: String,
    secret_key: String,
}

impl Credentials {
    /// Both keys must be non-empty
    pub fn new(public_key: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let public_key = public_key.into();
        let secret_key = secret_key.into();

        if public_key.trim().is_empty() || secret_key.trim().is_empty() {
            return Err(ExchangeError::InvalidCredentials);
        }

        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Load credentials from `PUBLIC_KEY` and `SECRET_KEY`
    pub fn from_env() -> Result<Self> {
        let public_key = std::env::var(PUBLIC_KEY_VAR)
            .map_err(|_| ExchangeError::MissingCredentials(PUBLIC_KEY_VAR.to_string()))?;
        let secret_key = std::env::var(SECRET_KEY_VAR)
            .map_err(|_| ExchangeError::MissingCredentials(SECRET_KEY_VAR.to_string()))?;

        Self::new(public_key, secret_key)
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Insertion-ordered request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.pairs.push((key.into(), value.to_string()));
    }

    /// Push only when `value` is present
    pub fn push_opt<V: ToString>(&mut self, key: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `application/x-www-form-urlencoded` in insertion order
    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.push(k, v);
        }
        params
    }
}

/// Binance request signer
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
}

impl Signer {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn api_key(&self) -> &str {
        self.credentials.public_key()
    }

    /// Lowercase hex HMAC-SHA256 of `payload`
    pub fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Signing(format!("HMAC setup failed: {e}")))?;

        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Append `timestamp` and then `signature` over everything before it
    pub fn sign_params(&self, params: &mut QueryParams, timestamp_ms: u64) -> Result<()> {
        let _timer = PerfTimer::start("binance_sign_request");

        params.push("timestamp", timestamp_ms);
        let signature = self.sign(&params.encode())?;
        params.push("signature", signature);

        debug!("🔐 Signed {} parameters at {}", params.len(), timestamp_ms);
        Ok(())
    }

    /// Whether `signature` matches `payload`
    pub fn verify(&self, payload: &str, signature: &str) -> bool {
        self.sign(payload).is_ok_and(|expected| expected == signature)
    }
}
