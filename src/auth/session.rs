//! HMAC-signed session cookies.
//!
//! Sessions are stateless: the cookie value is
//! `base64url(payload) . base64url(hmac-sha256(payload))`, verified in
//! constant time. No server-side session store exists, so any instance
//! holding the same secret can validate any cookie.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, KeyInit, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::Result;
use crate::config::SessionConfig;

type HmacSha256 = Hmac<Sha256>;

/// An authenticated identity carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Stable subject identifier
    pub sub: String,
    /// Email address, when the provider supplied one
    pub email: Option<String>,
    /// Which auth flow established this session
    pub provider: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
}

/// Signs, verifies and formats session cookies.
#[derive(Clone)]
pub struct SessionManager {
    mac: HmacSha256,
    cookie_name: String,
    cookie_domain: Option<String>,
    secure: bool,
    lifetime_secs: i64,
}

impl SessionManager {
    /// Build from config. When no secret is configured a random per-process
    /// secret is generated; sessions then reset on restart.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        let secret = config.resolve_secret().map_or_else(
            || {
                warn!(
                    "No session.secret configured; using a random per-process secret \
                     (sessions will not survive a restart)"
                );
                let random_bytes: [u8; 32] = rand::rng().random();
                URL_SAFE_NO_PAD.encode(random_bytes)
            },
            |s| s,
        );

        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");

        Self {
            mac,
            cookie_name: config.cookie_name.clone(),
            cookie_domain: config.cookie_domain.clone(),
            secure: !config.cookie_insecure,
            lifetime_secs: i64::try_from(config.lifetime_secs).unwrap_or(i64::MAX),
        }
    }

    /// Cookie name sessions are stored under
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Create a new session for the given identity, expiring after the
    /// configured lifetime.
    #[must_use]
    pub fn issue(&self, sub: String, email: Option<String>, provider: &str) -> Session {
        let now = Utc::now().timestamp();
        Session {
            sub,
            email,
            provider: provider.to_string(),
            iat: now,
            exp: now + self.lifetime_secs,
        }
    }

    /// Encode and sign an arbitrary payload (sessions, OAuth2 state).
    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<String> {
        let json = serde_json::to_vec(payload)?;
        let body = URL_SAFE_NO_PAD.encode(&json);
        let sig = self.sign(body.as_bytes());
        Ok(format!("{body}.{sig}"))
    }

    /// Verify the signature and decode a payload. Returns `None` for any
    /// malformed, tampered or unparseable value.
    #[must_use]
    pub fn decode<T: DeserializeOwned>(&self, value: &str) -> Option<T> {
        let (body, sig) = value.split_once('.')?;

        let expected = self.sign(body.as_bytes());
        if !bool::from(expected.as_bytes().ct_eq(sig.as_bytes())) {
            return None;
        }

        let json = URL_SAFE_NO_PAD.decode(body).ok()?;
        serde_json::from_slice(&json).ok()
    }

    /// Decode a session cookie value, rejecting expired sessions.
    #[must_use]
    pub fn decode_session(&self, value: &str) -> Option<Session> {
        let session: Session = self.decode(value)?;
        if session.exp <= Utc::now().timestamp() {
            return None;
        }
        Some(session)
    }

    /// `Set-Cookie` value storing an encoded session.
    pub fn session_cookie(&self, session: &Session) -> Result<String> {
        let value = self.encode(session)?;
        let max_age = (session.exp - Utc::now().timestamp()).max(0);
        Ok(self.cookie(&self.cookie_name, &value, max_age))
    }

    /// `Set-Cookie` value clearing the session.
    #[must_use]
    pub fn clear_session_cookie(&self) -> String {
        self.cookie(&self.cookie_name, "", 0)
    }

    /// `Set-Cookie` value for a named short-lived auxiliary cookie
    /// (e.g. the OAuth2 state).
    pub fn aux_cookie<T: Serialize>(&self, name: &str, payload: &T, max_age: i64) -> Result<String> {
        let value = self.encode(payload)?;
        Ok(self.cookie(name, &value, max_age))
    }

    /// `Set-Cookie` value clearing a named auxiliary cookie.
    #[must_use]
    pub fn clear_aux_cookie(&self, name: &str) -> String {
        self.cookie(name, "", 0)
    }

    fn cookie(&self, name: &str, value: &str, max_age: i64) -> String {
        let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Some(domain) = &self.cookie_domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        cookie
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(data);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// Extract a named cookie's value from a `Cookie` request header.
#[must_use]
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}
