//! Error types for the gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or assembled
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate watcher failed to start or died unexpectedly
    #[error("Certificate watch error: {0}")]
    CertWatch(String),

    /// `Server::run` was invoked while a run is already in progress
    #[error("Server is already running")]
    AlreadyRunning,

    /// A listener failed to start or its serve loop died
    #[error("Server error: {0}")]
    Server(String),

    /// Authentication provider error
    #[error("Auth error: {0}")]
    Auth(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
