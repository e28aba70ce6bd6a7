//! Configuration management

use std::env;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::validators;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Application server configuration
    pub server: ServerConfig,
    /// Metrics server configuration
    pub metrics: MetricsConfig,
    /// TLS configuration for the application server
    pub tls: TlsConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Session cookie configuration
    pub session: SessionConfig,

    /// Path of the config file this snapshot was loaded from, if any.
    /// Used to default the TLS directory.
    #[serde(skip)]
    loaded_path: Option<PathBuf>,
}

/// Application server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Base path all auth routes are mounted under (e.g. `/_auth`).
    /// Empty means the server root.
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 4181,
            base_path: String::new(),
        }
    }
}

/// Metrics server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the metrics server
    pub enabled: bool,
    /// Host to bind the metrics server to
    pub bind: String,
    /// Port for the metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_string(),
            port: 2112,
        }
    }
}

/// TLS configuration for the application server.
///
/// Certificates come either from the inline PEM values or from a directory
/// on disk (`path`, defaulting to the directory of the loaded config file).
/// When neither a certificate nor a key can be found anywhere, the server
/// runs cleartext with HTTP/2 upgrade support.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Request (but do not require) client certificates, verified against
    /// the CA. Sensitive routes then enforce that a certificate was given.
    pub client_auth: bool,
    /// Inline PEM-encoded CA certificate used for client verification
    pub ca_pem: Option<String>,
    /// Inline PEM-encoded server certificate (chain)
    pub cert_pem: Option<String>,
    /// Inline PEM-encoded server private key
    pub key_pem: Option<String>,
    /// Directory containing `tls-ca.pem`, `tls-cert.pem` and `tls-key.pem`.
    /// Overrides the config-file-directory default.
    pub path: Option<PathBuf>,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Which auth flow the gateway runs
    pub provider: ProviderKind,
    /// OAuth2 authorization-code flow settings
    pub oauth2: OAuth2Config,
    /// Seamless (pre-authenticated header) flow settings
    pub seamless: SeamlessConfig,
}

/// Auth flow selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Interactive OAuth2 authorization-code flow
    #[default]
    OAuth2,
    /// Identity established upstream (trusted headers), no redirect
    Seamless,
}

/// OAuth2 authorization-code flow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    /// OAuth2 client ID (supports `env:VAR_NAME`)
    pub client_id: String,
    /// OAuth2 client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Userinfo endpoint URL, queried after the code exchange
    pub userinfo_endpoint: String,
    /// Scopes to request
    pub scopes: Vec<String>,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            authorization_endpoint: String::new(),
            token_endpoint: String::new(),
            userinfo_endpoint: String::new(),
            scopes: vec!["openid".to_string(), "email".to_string()],
        }
    }
}

impl OAuth2Config {
    /// Resolve a credential value (expand `env:VAR_NAME` references)
    #[must_use]
    pub fn resolve(value: &str) -> String {
        if let Some(var_name) = value.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }
}

/// Seamless flow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeamlessConfig {
    /// Header carrying the pre-authenticated user ID
    pub user_header: String,
    /// Header carrying the pre-authenticated email address
    pub email_header: String,
}

impl Default for SeamlessConfig {
    fn default() -> Self {
        Self {
            user_header: "X-Forwarded-User".to_string(),
            email_header: "X-Forwarded-Email".to_string(),
        }
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HMAC signing secret (supports `env:VAR_NAME`). When unset, a random
    /// per-process secret is generated and sessions reset on restart.
    pub secret: Option<String>,
    /// Cookie name
    pub cookie_name: String,
    /// Cookie domain attribute, if any
    pub cookie_domain: Option<String>,
    /// Allow the cookie over cleartext HTTP (drops the Secure attribute)
    pub cookie_insecure: bool,
    /// Session lifetime in seconds
    pub lifetime_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            cookie_name: "__authgate_session".to_string(),
            cookie_domain: None,
            cookie_insecure: false,
            lifetime_secs: 7200,
        }
    }
}

impl SessionConfig {
    /// Resolve the signing secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        self.secret.as_ref().map(|s| {
            if let Some(var_name) = s.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| s.clone())
            } else {
                s.clone()
            }
        })
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (AUTHGATE_ prefix)
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.loaded_path = path.map(Path::to_path_buf);

        // Load env files into the process environment so `env:` references
        // resolve later.
        config.load_env_files();

        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Validate field formats that figment cannot check
    fn validate(&self) -> Result<()> {
        for (name, bind) in [("server.bind", &self.server.bind), ("metrics.bind", &self.metrics.bind)] {
            if !validators::is_ip(bind) && !validators::is_hostname(bind) {
                return Err(Error::Config(format!(
                    "{name}: '{bind}' is neither an IP address nor a hostname"
                )));
            }
        }

        let base = &self.server.base_path;
        if !base.is_empty() && (!base.starts_with('/') || base.ends_with('/')) {
            return Err(Error::Config(format!(
                "server.base_path: '{base}' must start with '/' and must not end with '/'"
            )));
        }

        Ok(())
    }

    /// Path of the loaded config file, if any
    #[must_use]
    pub fn loaded_config_path(&self) -> Option<&Path> {
        self.loaded_path.as_deref()
    }

    /// Record where this config was loaded from. Primarily for tests that
    /// build a `Config` without going through [`Config::load`].
    pub fn set_loaded_config_path(&mut self, path: Option<PathBuf>) {
        self.loaded_path = path;
    }

    /// The directory TLS material is read from: the explicit `tls.path`
    /// override, else the directory of the loaded config file.
    #[must_use]
    pub fn resolve_tls_path(&self) -> Option<PathBuf> {
        self.tls
            .path
            .clone()
            .or_else(|| self.loaded_path.as_ref().and_then(|p| p.parent().map(Path::to_path_buf)))
    }
}
