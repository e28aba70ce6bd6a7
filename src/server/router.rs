//! Route wiring for the application and metrics servers.
//!
//! The application route table mirrors the forward-auth surface:
//!
//! - `/healthz` - unauthenticated health check, ignores the base path
//! - `<base>/` - auth root; the handler depends on the provider variant,
//!   chosen once at wiring time
//! - `<base>/oauth2/callback` - OAuth2 flow only
//! - `<base>/profile`, `<base>/logout` - shared session operations
//! - `/api/verify` - proxy decision endpoint; no base path, no client
//!   certificate requirement

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::http::Request;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthState, Provider};

/// Request-id maker backed by UUIDv4, matching the proxy's header name.
#[derive(Clone, Copy, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Build the application router.
pub(crate) fn build_app_router(state: Arc<AuthState>) -> Router {
    let base = state.config.server.base_path.clone();
    let root_path = if base.is_empty() {
        "/".to_string()
    } else {
        base.clone()
    };

    // Root route: dispatch on the provider variant exactly once, here.
    // Sensitive, so it carries the client-certificate guard; the session is
    // loaded so an authenticated visit answers without a round trip.
    let root_handler = match &state.provider {
        Provider::OAuth2(_) => get(auth::oauth2::oauth2_root),
        Provider::Seamless(_) => get(auth::seamless::seamless_root),
    }
    .layer(middleware::from_fn_with_state(
        state.clone(),
        auth::load_session_middleware,
    ))
    .layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_client_certificate,
    ));

    let mut auth_routes = Router::new().route(&root_path, root_handler.clone());
    // Register the base path with and without a trailing slash so the
    // router never answers a 301, which breaks forward-auth callers.
    if !base.is_empty() {
        auth_routes = auth_routes.route(&format!("{base}/"), root_handler);
    }

    if matches!(state.provider, Provider::OAuth2(_)) {
        auth_routes = auth_routes.route(
            &format!("{base}/oauth2/callback"),
            get(auth::oauth2::oauth2_callback),
        );
    }

    auth_routes = auth_routes
        .route(
            &format!("{base}/profile"),
            get(auth::profile).layer(middleware::from_fn_with_state(
                state.clone(),
                auth::load_session_middleware,
            )),
        )
        .route(&format!("{base}/logout"), get(auth::logout))
        .layer(middleware::from_fn(auth::proxy_headers_middleware));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(auth_routes)
        // The proxy calls this for every request; it does not follow the
        // base path and must not require a client certificate.
        .route("/api/verify", get(auth::verify))
        .with_state(state)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

/// Build the metrics router: scrape endpoint plus health check, mounted on
/// the metrics listener only.
pub(crate) fn build_metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
}

/// Unauthenticated health check, mounted on both servers.
async fn healthz() -> &'static str {
    "ok"
}
