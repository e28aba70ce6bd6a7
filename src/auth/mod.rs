//! Authentication providers and the route-facing auth surface.
//!
//! The gateway runs exactly one auth flow, chosen at startup:
//!
//! - [`Provider::OAuth2`] - interactive authorization-code flow (root +
//!   callback handlers)
//! - [`Provider::Seamless`] - identity established upstream and carried in
//!   trusted headers (root handler only)
//!
//! Route wiring branches once over this tag; the shared operations
//! (load-session middleware, profile, logout, and the proxy-facing verify
//! handler) are common to both.

pub mod oauth2;
pub mod seamless;
pub mod session;

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use crate::config::{Config, ProviderKind};
use crate::metrics;
use crate::tls::accept::PeerIdentity;
use crate::Result;

pub use oauth2::OAuth2Provider;
pub use seamless::SeamlessProvider;
pub use session::{Session, SessionManager};

/// The configured auth flow. Resolved once at startup; route wiring
/// branches over the variant a single time.
pub enum Provider {
    /// Interactive OAuth2 authorization-code flow
    OAuth2(OAuth2Provider),
    /// Pre-authenticated trusted-header flow
    Seamless(SeamlessProvider),
}

impl Provider {
    /// Build the provider selected by the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.auth.provider {
            ProviderKind::OAuth2 => Ok(Self::OAuth2(OAuth2Provider::from_config(
                &config.auth.oauth2,
            )?)),
            ProviderKind::Seamless => Ok(Self::Seamless(SeamlessProvider::from_config(
                &config.auth.seamless,
            )?)),
        }
    }

    /// Short name used in logs, metrics and session payloads
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OAuth2(_) => "oauth2",
            Self::Seamless(_) => "seamless",
        }
    }
}

/// Shared state behind every auth route.
pub struct AuthState {
    /// Configuration snapshot
    pub config: Arc<Config>,
    /// The active auth flow
    pub provider: Provider,
    /// Session cookie codec
    pub sessions: SessionManager,
}

impl AuthState {
    /// Assemble the auth state from configuration.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let provider = Provider::from_config(&config)?;
        let sessions = SessionManager::from_config(&config.session);
        Ok(Self {
            config,
            provider,
            sessions,
        })
    }
}

// ---------------------------------------------------------------------------
// Request context from the reverse proxy
// ---------------------------------------------------------------------------

/// The original request as reconstructed from the proxy's
/// `X-Forwarded-*` headers.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    /// Original scheme (`http` / `https`)
    pub proto: String,
    /// Original host
    pub host: String,
    /// Original request URI (path + query)
    pub uri: String,
}

impl ForwardedRequest {
    /// Read the proxy headers, falling back to the direct request fields.
    #[must_use]
    pub fn from_request(headers: &HeaderMap, fallback_uri: &str) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            proto: get("x-forwarded-proto").unwrap_or_else(|| "http".to_string()),
            host: get("x-forwarded-host")
                .or_else(|| get("host"))
                .unwrap_or_else(|| "localhost".to_string()),
            uri: get("x-forwarded-uri").unwrap_or_else(|| fallback_uri.to_string()),
        }
    }

    /// The URL the client originally requested through the proxy.
    #[must_use]
    pub fn original_url(&self) -> String {
        format!("{}://{}{}", self.proto, self.host, self.uri)
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Capture the proxy's `X-Forwarded-*` context as a request extension.
pub async fn proxy_headers_middleware(mut request: Request, next: Next) -> Response {
    let fallback_uri = request
        .uri()
        .path_and_query()
        .map_or("/", axum::http::uri::PathAndQuery::as_str)
        .to_string();
    let forwarded = ForwardedRequest::from_request(request.headers(), &fallback_uri);
    request.extensions_mut().insert(forwarded);
    next.run(request).await
}

/// Decode the session cookie, if any, into a [`Session`] extension.
pub async fn load_session_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(session) = session_from_headers(&state, request.headers()) {
        request.extensions_mut().insert(session);
    }
    next.run(request).await
}

/// Reject requests without a verified client certificate when mutual TLS is
/// enabled. A no-op otherwise, so the same route table serves both modes.
pub async fn require_client_certificate(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.tls.client_auth {
        let presented = request
            .extensions()
            .get::<PeerIdentity>()
            .is_some_and(|p| p.presented);
        if !presented {
            debug!("Rejecting request without client certificate");
            return error_response(StatusCode::UNAUTHORIZED, "client certificate required");
        }
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Shared handlers
// ---------------------------------------------------------------------------

/// `GET <base>/profile` - the authenticated identity as JSON.
pub async fn profile(session: Option<axum::Extension<Session>>) -> Response {
    match session {
        Some(axum::Extension(session)) => Json(json!({
            "sub": session.sub,
            "email": session.email,
            "provider": session.provider,
            "iat": session.iat,
            "exp": session.exp,
        }))
        .into_response(),
        None => error_response(StatusCode::UNAUTHORIZED, "not authenticated"),
    }
}

/// `GET <base>/logout` - clear the session cookie.
pub async fn logout(State(state): State<Arc<AuthState>>) -> Response {
    let mut headers = HeaderMap::new();
    set_cookie(&mut headers, &state.sessions.clear_session_cookie());
    (headers, Json(json!({"status": "signed_out"}))).into_response()
}

/// `GET /api/verify` - the machine-checkable decision endpoint the reverse
/// proxy calls for every request. Answers 200 plus identity headers for a
/// valid session, 401 otherwise. Does not follow the base path and never
/// redirects.
pub async fn verify(State(state): State<Arc<AuthState>>, headers: HeaderMap) -> Response {
    match session_from_headers(&state, &headers) {
        Some(session) => {
            metrics::record_verify("allow");
            let headers = identity_headers(&session);
            (StatusCode::OK, headers, Json(json!({"status": "ok"}))).into_response()
        }
        None => {
            metrics::record_verify("deny");
            error_response(StatusCode::UNAUTHORIZED, "not authenticated")
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers shared across the flows
// ---------------------------------------------------------------------------

/// Decode a session from the `Cookie` request header.
#[must_use]
pub fn session_from_headers(state: &AuthState, headers: &HeaderMap) -> Option<Session> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    let value = session::cookie_value(cookie_header, state.sessions.cookie_name())?;
    state.sessions.decode_session(value)
}

/// Identity headers the proxy copies onto the upstream request.
#[must_use]
pub fn identity_headers(session: &Session) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&session.sub) {
        headers.insert("x-forwarded-user", value);
    }
    if let Some(email) = &session.email {
        if let Ok(value) = HeaderValue::from_str(email) {
            headers.insert("x-forwarded-email", value);
        }
    }
    headers
}

/// Append a `Set-Cookie` header, ignoring (rare) invalid values.
pub(crate) fn set_cookie(headers: &mut HeaderMap, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        headers.append(header::SET_COOKIE, value);
    }
}

/// Uniform JSON error body.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
