//! OAuth2 authorization-code flow.
//!
//! Deliberately small: redirect with a signed state cookie, exchange the
//! code at the token endpoint, and resolve the identity via the userinfo
//! endpoint. No JWKS/JWT validation layer - the identity provider is
//! trusted at the transport level.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{
    AuthState, ForwardedRequest, Provider, Session, error_response, identity_headers, session,
    set_cookie,
};
use crate::config::OAuth2Config;
use crate::metrics;
use crate::validators;
use crate::{Error, Result};

/// Cookie holding the signed state claim between redirect and callback.
const STATE_COOKIE: &str = "__authgate_state";

/// How long a login attempt may take before its state expires.
const STATE_TTL_SECS: i64 = 600;

/// OAuth2 authorization-code flow provider.
pub struct OAuth2Provider {
    client_id: String,
    client_secret: String,
    authorization_endpoint: Url,
    token_endpoint: String,
    userinfo_endpoint: String,
    scopes: String,
    http: reqwest::Client,
}

/// State claim carried through the redirect, signed into [`STATE_COOKIE`].
#[derive(Debug, Serialize, Deserialize)]
struct StateClaim {
    nonce: String,
    redirect: String,
    exp: i64,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Userinfo endpoint response
#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
}

/// Callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl OAuth2Provider {
    /// Build the provider, resolving `env:` credential references.
    pub fn from_config(config: &OAuth2Config) -> Result<Self> {
        for (name, value) in [
            ("auth.oauth2.client_id", &config.client_id),
            ("auth.oauth2.authorization_endpoint", &config.authorization_endpoint),
            ("auth.oauth2.token_endpoint", &config.token_endpoint),
            ("auth.oauth2.userinfo_endpoint", &config.userinfo_endpoint),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!(
                    "{name} is required for the oauth2 provider"
                )));
            }
        }

        let authorization_endpoint = Url::parse(&config.authorization_endpoint).map_err(|e| {
            Error::Config(format!(
                "auth.oauth2.authorization_endpoint is not a valid URL: {e}"
            ))
        })?;

        Ok(Self {
            client_id: OAuth2Config::resolve(&config.client_id),
            client_secret: OAuth2Config::resolve(&config.client_secret),
            authorization_endpoint,
            token_endpoint: config.token_endpoint.clone(),
            userinfo_endpoint: config.userinfo_endpoint.clone(),
            scopes: config.scopes.join(" "),
            http: reqwest::Client::new(),
        })
    }

    /// The authorization URL a fresh login is redirected to.
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.scopes)
            .append_pair("state", state);
        url.to_string()
    }

    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Resolve the authenticated identity from the userinfo endpoint.
    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo> {
        let response = self
            .http
            .get(&self.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "userinfo endpoint answered {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

/// The redirect URI registered with the identity provider, derived from the
/// proxy context so it matches whatever host the user came in through.
fn callback_uri(state: &AuthState, fwd: &ForwardedRequest) -> String {
    format!(
        "{}://{}{}/oauth2/callback",
        fwd.proto, fwd.host, state.config.server.base_path
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET <base>/` for the OAuth2 flow: answer 200 plus identity headers for
/// an authenticated session, otherwise start the authorization-code dance.
pub async fn oauth2_root(
    State(state): State<Arc<AuthState>>,
    session: Option<axum::Extension<Session>>,
    axum::Extension(fwd): axum::Extension<ForwardedRequest>,
) -> Response {
    let Provider::OAuth2(provider) = &state.provider else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "provider mismatch");
    };

    if let Some(axum::Extension(session)) = session {
        metrics::record_auth_request("oauth2", "allow");
        return (StatusCode::OK, identity_headers(&session)).into_response();
    }

    // Not authenticated: remember where the user was headed and redirect to
    // the identity provider.
    let nonce: [u8; 16] = rand::rng().random();
    let claim = StateClaim {
        nonce: URL_SAFE_NO_PAD.encode(nonce),
        redirect: fwd.original_url(),
        exp: Utc::now().timestamp() + STATE_TTL_SECS,
    };

    let Ok(state_token) = state.sessions.encode(&claim) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode state");
    };
    let Ok(state_cookie) = state
        .sessions
        .aux_cookie(STATE_COOKIE, &claim, STATE_TTL_SECS)
    else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode state");
    };

    let location = provider.authorize_url(&callback_uri(&state, &fwd), &state_token);

    metrics::record_auth_request("oauth2", "redirect");
    debug!(redirect = %claim.redirect, "Starting OAuth2 authorization flow");

    let mut headers = HeaderMap::new();
    set_cookie(&mut headers, &state_cookie);
    (headers, Redirect::temporary(&location)).into_response()
}

/// `GET <base>/oauth2/callback`: validate the state, exchange the code,
/// establish the session and return to the original URL.
pub async fn oauth2_callback(
    State(state): State<Arc<AuthState>>,
    Query(params): Query<CallbackParams>,
    axum::Extension(fwd): axum::Extension<ForwardedRequest>,
    headers: HeaderMap,
) -> Response {
    let Provider::OAuth2(provider) = &state.provider else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "provider mismatch");
    };

    if let Some(error) = params.error {
        metrics::record_auth_request("oauth2", "provider_error");
        warn!(error = %error, "Identity provider reported an authorization error");
        return error_response(StatusCode::UNAUTHORIZED, "authorization failed");
    }

    let (Some(code), Some(state_param)) = (params.code, params.state) else {
        metrics::record_auth_request("oauth2", "bad_callback");
        return error_response(StatusCode::BAD_REQUEST, "missing code or state");
    };

    // The state must decode, match the cookie copy, and be fresh.
    let Some(claim) = state.sessions.decode::<StateClaim>(&state_param) else {
        metrics::record_auth_request("oauth2", "bad_state");
        return error_response(StatusCode::UNAUTHORIZED, "invalid state");
    };

    let cookie_claim = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|header| session::cookie_value(header, STATE_COOKIE))
        .and_then(|value| state.sessions.decode::<StateClaim>(value));

    let valid = cookie_claim.is_some_and(|c| c.nonce == claim.nonce)
        && claim.exp > Utc::now().timestamp();
    if !valid {
        metrics::record_auth_request("oauth2", "bad_state");
        return error_response(StatusCode::UNAUTHORIZED, "invalid or expired state");
    }

    // Exchange the code and resolve the identity.
    let user = match exchange_and_fetch(provider, &code, &callback_uri(&state, &fwd)).await {
        Ok(user) => user,
        Err(e) => {
            metrics::record_auth_request("oauth2", "exchange_failed");
            warn!(error = %e, "OAuth2 code exchange failed");
            return error_response(StatusCode::UNAUTHORIZED, "code exchange failed");
        }
    };

    if let Some(email) = &user.email {
        if !validators::email(email) {
            metrics::record_auth_request("oauth2", "bad_email");
            warn!("Userinfo endpoint returned a malformed email address");
            return error_response(StatusCode::UNAUTHORIZED, "invalid identity");
        }
    }

    let session = state.sessions.issue(user.sub, user.email, "oauth2");
    let Ok(session_cookie) = state.sessions.session_cookie(&session) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode session");
    };

    metrics::record_auth_request("oauth2", "allow");
    debug!(sub = %session.sub, "OAuth2 login complete");

    let mut response_headers = HeaderMap::new();
    set_cookie(&mut response_headers, &session_cookie);
    set_cookie(
        &mut response_headers,
        &state.sessions.clear_aux_cookie(STATE_COOKIE),
    );
    (response_headers, Redirect::temporary(&claim.redirect)).into_response()
}

async fn exchange_and_fetch(
    provider: &OAuth2Provider,
    code: &str,
    redirect_uri: &str,
) -> Result<UserInfo> {
    let token = provider.exchange_code(code, redirect_uri).await?;
    provider.fetch_userinfo(&token.access_token).await
}
