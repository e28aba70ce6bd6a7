//! Seamless (pre-authenticated) flow.
//!
//! The identity is established before the request reaches this gateway -
//! a zero-trust tunnel, an SSO sidecar, or the proxy itself - and carried
//! in trusted headers. The gateway validates the header formats, mints its
//! own session cookie, and answers without any interactive redirect.
//!
//! The trusted headers must be stripped from client traffic at the network
//! edge; this gateway cannot tell a proxy-set header from a forged one.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::{AuthState, Session, error_response, identity_headers, set_cookie};
use crate::config::SeamlessConfig;
use crate::metrics;
use crate::validators;
use crate::{Error, Result};

/// Seamless flow provider.
pub struct SeamlessProvider {
    user_header: String,
    email_header: String,
}

impl SeamlessProvider {
    /// Build the provider from configuration.
    pub fn from_config(config: &SeamlessConfig) -> Result<Self> {
        if config.user_header.is_empty() {
            return Err(Error::Config(
                "auth.seamless.user_header must not be empty".to_string(),
            ));
        }
        Ok(Self {
            user_header: config.user_header.to_lowercase(),
            email_header: config.email_header.to_lowercase(),
        })
    }

    /// Extract and validate the upstream identity from the trusted headers.
    ///
    /// The user header must be present; an email header, when present, must
    /// be a well-formed address.
    fn identity_from_headers(&self, headers: &HeaderMap) -> Option<(String, Option<String>)> {
        let user = headers
            .get(&self.user_header)?
            .to_str()
            .ok()
            .filter(|v| !v.is_empty())?
            .to_string();

        let email = headers
            .get(&self.email_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);

        if let Some(email) = &email {
            if !validators::email(email) {
                return None;
            }
        }

        // A user value that itself looks like an email must be well-formed.
        if user.contains('@') && !validators::email(&user) {
            return None;
        }

        Some((user, email))
    }
}

/// `GET <base>/` for the seamless flow: establish or confirm the session
/// from trusted headers, no redirects involved.
pub async fn seamless_root(
    State(state): State<Arc<AuthState>>,
    session: Option<axum::Extension<Session>>,
    headers: HeaderMap,
) -> Response {
    let super::Provider::Seamless(provider) = &state.provider else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "provider mismatch");
    };

    if let Some(axum::Extension(session)) = session {
        metrics::record_auth_request("seamless", "allow");
        return (StatusCode::OK, identity_headers(&session)).into_response();
    }

    let Some((user, email)) = provider.identity_from_headers(&headers) else {
        metrics::record_auth_request("seamless", "deny");
        return error_response(StatusCode::UNAUTHORIZED, "no trusted identity");
    };

    let session = state.sessions.issue(user, email, "seamless");
    let Ok(cookie) = state.sessions.session_cookie(&session) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode session");
    };

    metrics::record_auth_request("seamless", "allow");
    debug!(sub = %session.sub, "Seamless session established");

    let mut response_headers = identity_headers(&session);
    set_cookie(&mut response_headers, &cookie);
    (StatusCode::OK, response_headers).into_response()
}
