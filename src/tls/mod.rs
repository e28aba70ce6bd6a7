//! TLS material resolution and rustls config assembly.
//!
//! Decides, at startup, where the application server's TLS material comes
//! from:
//!
//! - inline PEM values in the configuration,
//! - a directory on disk (hot-reloaded via [`reload::CertProvider`]),
//! - or nowhere, in which case TLS is disabled and the server runs
//!   cleartext with HTTP/2 upgrade support.
//!
//! When `tls.client_auth` is enabled, a CA trust pool is built and client
//! certificates are verified **if given** (not required) - only a subset of
//! routes enforces their presence.
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**, under the
//! fixed names [`TLS_CA_FILE`], [`TLS_CERT_FILE`] and [`TLS_KEY_FILE`].

pub mod accept;
pub mod reload;

use std::fs;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier, danger::ClientCertVerifier};
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, Result};

/// CA certificate file name inside the TLS directory
pub const TLS_CA_FILE: &str = "tls-ca.pem";
/// Server certificate file name inside the TLS directory
pub const TLS_CERT_FILE: &str = "tls-cert.pem";
/// Server key file name inside the TLS directory
pub const TLS_KEY_FILE: &str = "tls-key.pem";

/// Assembled TLS state for the application listener.
pub struct TlsContext {
    /// The rustls config the listener serves with. Built once; only the
    /// certificate snapshot behind its resolver is ever swapped.
    pub server_config: Arc<ServerConfig>,
    /// Present when certificates came from disk; the supervisor must run
    /// [`reload::CertProvider::watch`] for rotation to happen.
    pub provider: Option<reload::CertProvider>,
}

/// Resolve the TLS configuration from the config snapshot.
///
/// Returns `Ok(None)` when no TLS material is configured anywhere - a
/// valid configuration meaning "serve cleartext". A half-specified inline
/// pair (cert without key, or vice versa) is rejected.
///
/// # Errors
///
/// Returns an error for malformed PEM, a missing CA while `client_auth` is
/// enabled, unreadable files, or a partial cert/key pair.
pub fn load(config: &Config) -> Result<Option<TlsContext>> {
    let tls_path = config.resolve_tls_path();

    // CA pool first: mutual TLS was explicitly requested, so any failure
    // to produce the pool is fatal.
    let client_verifier = if config.tls.client_auth {
        let ca_pem = match non_empty(config.tls.ca_pem.as_deref()) {
            Some(pem) => {
                debug!("Loaded CA certificate from inline PEM value");
                pem.as_bytes().to_vec()
            }
            None => {
                let Some(dir) = tls_path.as_deref() else {
                    return Err(Error::Config(
                        "cannot find a CA certificate, which is required when tls.client_auth \
                         is enabled: no tls.path configured and no config file was loaded"
                            .to_string(),
                    ));
                };
                let path = dir.join(TLS_CA_FILE);
                let bytes = fs::read(&path).map_err(|e| {
                    Error::Config(format!(
                        "failed to load CA certificate from '{}' while tls.client_auth is enabled: {e}",
                        path.display()
                    ))
                })?;
                debug!(path = %dir.display(), "Loaded CA certificate from disk");
                bytes
            }
        };

        Some(build_client_verifier(&ca_pem)?)
    } else {
        None
    };

    // Server identity next.
    let cert_pem = non_empty(config.tls.cert_pem.as_deref());
    let key_pem = non_empty(config.tls.key_pem.as_deref());

    match (cert_pem, key_pem) {
        // Inline PEM pair: static certificate list, no watcher.
        (Some(cert), Some(key)) => {
            let chain = parse_certs(cert.as_bytes(), "tls.cert_pem")?;
            let private_key = parse_private_key(key.as_bytes(), "tls.key_pem")?;
            let server_config =
                build_server_config(client_verifier, ServerIdentity::Static(chain, private_key))?;
            debug!("Loaded TLS certificates from inline PEM values");
            Ok(Some(TlsContext {
                server_config: Arc::new(server_config),
                provider: None,
            }))
        }

        // Nothing inline: defer to the hot-reload provider, or disable TLS.
        (None, None) => {
            let Some(dir) = tls_path else {
                warn!(
                    "No inline TLS values and no TLS directory resolvable; serving cleartext HTTP"
                );
                return Ok(None);
            };

            let Some(provider) = reload::CertProvider::from_dir(&dir)? else {
                warn!(
                    path = %dir.display(),
                    "No TLS certificates found in TLS directory; serving cleartext HTTP"
                );
                return Ok(None);
            };

            debug!(path = %dir.display(), "Loaded TLS certificates from disk");
            let server_config = build_server_config(
                client_verifier,
                ServerIdentity::Resolver(provider.resolver()),
            )?;
            Ok(Some(TlsContext {
                server_config: Arc::new(server_config),
                provider: Some(provider),
            }))
        }

        // A half-specified pair is an operator mistake, not a mode.
        _ => Err(Error::Config(
            "tls.cert_pem and tls.key_pem must either both be set or both be empty".to_string(),
        )),
    }
}

/// How the server proves its identity.
enum ServerIdentity {
    /// Fixed certificate chain and key parsed at startup
    Static(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>),
    /// Per-handshake lookup backed by the hot-reload provider
    Resolver(Arc<dyn ResolvesServerCert>),
}

/// Assemble the final `rustls::ServerConfig`: TLS 1.3 floor, ALPN for h2 and
/// http/1.1, optional verify-if-given client auth, and the server identity.
/// No network or disk I/O.
fn build_server_config(
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    identity: ServerIdentity,
) -> Result<ServerConfig> {
    ensure_crypto_provider();

    let builder = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let builder = match client_verifier {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };

    let mut tls_cfg = match identity {
        ServerIdentity::Static(chain, key) => builder
            .with_single_cert(chain, key)
            .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?,
        ServerIdentity::Resolver(resolver) => builder.with_cert_resolver(resolver),
    };

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(tls_cfg)
}

/// Build a verify-if-given client certificate verifier from CA PEM bytes.
fn build_client_verifier(ca_pem: &[u8]) -> Result<Arc<dyn ClientCertVerifier>> {
    let ca_certs = parse_certs(ca_pem, "CA certificate")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Tls(format!("failed to add CA cert to trust store: {e}")))?;
    }

    ensure_crypto_provider();

    // Not all routes require mTLS, so unauthenticated clients must still
    // complete the handshake; sensitive routes enforce presence later.
    WebPkiClientVerifier::builder(Arc::new(root_store))
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::Tls(format!("failed to build client verifier: {e}")))
}

/// Parse all certificates from PEM bytes.
pub(crate) fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse {what}: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {what}")));
    }

    Ok(certs)
}

/// Parse the first private key from PEM bytes.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
pub(crate) fn parse_private_key(pem: &[u8], what: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Tls(format!("failed to parse private key from {what}: {e}")))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {what}")))
}

/// Install the process-default crypto provider if none is set yet.
pub(crate) fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
