//! Pluggable authentication for the listener's AUTH PLAIN support.

use base64::{engine::general_purpose::STANDARD, Engine};
use failmail_common::error::ConfigError;

/// Checks an AUTH PLAIN identity against some credential store.
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    fn authenticate(&self, authzid: &str, authcid: &str, password: &str) -> bool;
}

/// Accepts exactly one username/password pair.
#[derive(Debug, Clone)]
pub struct SingleUserPlainAuth {
    username: String,
    password: String,
}

impl SingleUserPlainAuth {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse the `--auth user:pass` flag value.
    ///
    /// # Errors
    /// If the value has no `:` separator.
    pub fn from_credentials(credentials: &str) -> Result<Self, ConfigError> {
        match credentials.split_once(':') {
            Some((username, password)) => Ok(Self::new(username, password)),
            None => Err(ConfigError::MalformedCredentials),
        }
    }
}

impl Authenticator for SingleUserPlainAuth {
    fn authenticate(&self, _authzid: &str, authcid: &str, password: &str) -> bool {
        authcid == self.username && password == self.password
    }
}

/// Decode the standard base64 `authzid\0authcid\0password` AUTH PLAIN
/// payload. Returns `None` for undecodable or misshapen payloads.
#[must_use]
pub fn decode_plain(payload: &str) -> Option<(String, String, String)> {
    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;

    let mut parts = text.split('\0');
    let authzid = parts.next()?.to_string();
    let authcid = parts.next()?.to_string();
    let password = parts.next()?.to_string();

    if parts.next().is_some() {
        return None;
    }
    Some((authzid, authcid, password))
}

/// Encode credentials for the client side of AUTH PLAIN.
#[must_use]
pub fn encode_plain(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{username}\0{password}"))
}
