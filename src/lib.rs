//! authgate - forward-authentication gateway
//!
//! A standalone authentication service for reverse proxies (forward auth):
//! the proxy delegates each request's allow/deny decision to this gateway,
//! which authenticates via an OAuth2 authorization-code flow, a
//! pre-authenticated "seamless" flow, or mutual-TLS client certificates,
//! and answers with identity headers.
//!
//! # Features
//!
//! - **Two listeners**: application traffic and operational metrics, each
//!   with its own lifecycle and shutdown budget
//! - **Zero-downtime TLS rotation**: certificates reloaded from disk on
//!   change without dropping connections
//! - **Mutual TLS**: verify-if-given client certificates for sensitive routes
//! - **Session cookies**: HMAC-signed, validated without server-side state
//! - **Production ready**: health checks, Prometheus metrics, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod tls;
pub mod tlsgen;
pub mod validators;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
