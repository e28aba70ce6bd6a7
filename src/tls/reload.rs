//! Certificate hot-reload provider.
//!
//! Keeps a live certificate/key snapshot sourced from a directory and
//! refreshes it when the underlying files change, without ever serving a
//! half-written or mismatched pair: the snapshot is only replaced after
//! *both* files re-parse successfully, and it is replaced wholesale, so a
//! handshake racing a rotation sees either the old pair or the new one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TLS_CERT_FILE, TLS_KEY_FILE, ensure_crypto_provider};
use crate::{Error, Result};

/// Stability window a file change must survive before the pair is re-read.
/// Long enough to ride out multi-step writers (write cert, then key).
const DEBOUNCE: Duration = Duration::from_millis(500);

/// How often the debounce window is checked.
const DEBOUNCE_TICK: Duration = Duration::from_millis(100);

/// Live certificate provider for a TLS directory.
///
/// Construction loads the initial snapshot; [`CertProvider::watch`] keeps it
/// fresh. The [`ResolvesServerCert`] handed to rustls reads the snapshot per
/// handshake and is safe for unbounded concurrent use.
///
/// Clones share the same snapshot channel, so the supervisor can hand one
/// clone to a background watch task while keeping the provider configured.
#[derive(Clone)]
pub struct CertProvider {
    dir: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
    tx: watch::Sender<Arc<CertifiedKey>>,
}

impl CertProvider {
    /// Scan `dir` for `tls-cert.pem`/`tls-key.pem` and load the initial
    /// snapshot.
    ///
    /// Returns `Ok(None)` when neither file exists - the absence of TLS
    /// material is a valid configuration, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when only one of the pair exists, or when either
    /// file is unreadable or fails to parse.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let cert_path = dir.join(TLS_CERT_FILE);
        let key_path = dir.join(TLS_KEY_FILE);

        if !cert_path.exists() && !key_path.exists() {
            return Ok(None);
        }

        let initial = load_certified_key(&cert_path, &key_path)?;
        let (tx, _) = watch::channel(initial);

        Ok(Some(Self {
            dir: dir.to_path_buf(),
            cert_path,
            key_path,
            tx,
        }))
    }

    /// Certificate lookup callback for the TLS config builder.
    #[must_use]
    pub fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(ReloadingCertResolver {
            rx: self.tx.subscribe(),
        })
    }

    /// The currently active snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<CertifiedKey> {
        self.tx.borrow().clone()
    }

    /// Re-parse the cert/key pair and swap the snapshot if both succeed.
    ///
    /// A failure keeps the previous snapshot - a bad rotation must never
    /// take the server offline. Returns whether the snapshot was replaced.
    fn try_reload(&self) -> bool {
        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(key) => {
                self.tx.send_replace(key);
                crate::metrics::record_cert_reload("success");
                info!(path = %self.dir.display(), "Reloaded TLS certificates from disk");
                true
            }
            Err(e) => {
                crate::metrics::record_cert_reload("failure");
                warn!(
                    error = %e,
                    path = %self.dir.display(),
                    "Failed to reload TLS certificates, keeping previous pair"
                );
                false
            }
        }
    }

    /// Watch the TLS directory for certificate changes until `token` fires.
    ///
    /// Changes are debounced so partial writes are never acted on; once a
    /// change has been stable for the debounce window the pair is re-read
    /// via [`Self::try_reload`].
    ///
    /// Returns `Ok(())` when the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be created or
    /// registered; the caller treats that as fatal to the run.
    pub async fn watch(self, token: CancellationToken) -> Result<()> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(32);

        let cert_path = self.cert_path.clone();
        let key_path = self.key_path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| is_cert_event(e, &cert_path, &key_path));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::CertWatch(format!("failed to create certificate watcher: {e}")))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::CertWatch(format!(
                    "failed to watch TLS path '{}': {e}",
                    self.dir.display()
                ))
            })?;

        info!(path = %self.dir.display(), "Watching TLS certificates for changes");

        let mut last_event: Option<Instant> = None;
        let mut pending = false;
        let mut ticker = tokio::time::interval(DEBOUNCE_TICK);

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                    pending = true;
                }
                _ = ticker.tick() => {
                    if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        pending = false;
                        last_event = None;
                        self.try_reload();
                    }
                }
                () = token.cancelled() => {
                    debug!("Certificate watcher shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Returns `true` for create/modify events touching the cert or key file.
fn is_cert_event(event: &Event, cert_path: &Path, key_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p == cert_path || p == key_path)
}

/// Per-handshake certificate lookup reading the current snapshot.
struct ReloadingCertResolver {
    rx: watch::Receiver<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadingCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.rx.borrow().clone())
    }
}

/// Parse a PEM cert/key pair into a rustls `CertifiedKey`.
fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| Error::Tls(format!("cannot read '{}': {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| Error::Tls(format!("cannot read '{}': {e}", key_path.display())))?;

    let chain = super::parse_certs(&cert_pem, "server certificate")?;
    let key = super::parse_private_key(&key_pem, "server key")?;

    ensure_crypto_provider();
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| Error::Tls("no rustls crypto provider installed".to_string()))?;

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| Error::Tls(format!("failed to load private key: {e}")))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlsgen;

    fn write_pair(dir: &Path) -> (tlsgen::GeneratedCert, tlsgen::GeneratedCert) {
        let ca = tlsgen::generate_ca("Reload Test CA").unwrap();
        let server = tlsgen::generate_server_cert(&ca, &["localhost".to_string()]).unwrap();
        std::fs::write(dir.join(TLS_CERT_FILE), &server.cert_pem).unwrap();
        std::fs::write(dir.join(TLS_KEY_FILE), &server.key_pem).unwrap();
        (ca, server)
    }

    fn snapshot_cert_der(provider: &CertProvider) -> Vec<u8> {
        provider.current().cert[0].as_ref().to_vec()
    }

    #[test]
    fn from_dir_returns_none_for_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CertProvider::from_dir(dir.path()).unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn from_dir_errors_when_only_cert_present() {
        let dir = tempfile::tempdir().unwrap();
        let (_, server) = {
            let scratch = tempfile::tempdir().unwrap();
            write_pair(scratch.path())
        };
        std::fs::write(dir.path().join(TLS_CERT_FILE), &server.cert_pem).unwrap();

        let result = CertProvider::from_dir(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn from_dir_loads_initial_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        assert!(!provider.current().cert.is_empty());
    }

    #[test]
    fn resolver_returns_current_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let resolver = provider.resolver();
        // ResolvesServerCert::resolve needs a ClientHello we cannot fabricate
        // here; the snapshot it clones is observable through current().
        assert!(Arc::ptr_eq(
            &provider.current(),
            &provider.tx.borrow().clone()
        ));
        drop(resolver);
    }

    #[test]
    fn try_reload_swaps_snapshot_on_valid_replacement() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let before = snapshot_cert_der(&provider);

        // Replace with a fresh pair on disk.
        write_pair(dir.path());
        assert!(provider.try_reload());

        let after = snapshot_cert_der(&provider);
        assert_ne!(before, after, "snapshot should carry the new certificate");
    }

    #[test]
    fn try_reload_keeps_previous_snapshot_on_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let before = snapshot_cert_der(&provider);

        // Simulate an in-progress write: truncated cert, key untouched.
        std::fs::write(dir.path().join(TLS_CERT_FILE), b"-----BEGIN CERT").unwrap();
        assert!(!provider.try_reload());

        let after = snapshot_cert_der(&provider);
        assert_eq!(before, after, "old pair must keep serving");
    }

    #[test]
    fn try_reload_keeps_previous_snapshot_on_mismatched_key() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let before = snapshot_cert_der(&provider);

        // Key file replaced with garbage mid-rotation.
        std::fs::write(dir.path().join(TLS_KEY_FILE), b"not a key").unwrap();
        assert!(!provider.try_reload());
        assert_eq!(before, snapshot_cert_der(&provider));
    }

    #[tokio::test]
    async fn watch_returns_ok_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let token = CancellationToken::new();

        let handle = tokio::spawn(provider.watch(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watch should stop promptly")
            .expect("watch task should not panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn watch_picks_up_rotated_pair() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());

        let provider = CertProvider::from_dir(dir.path()).unwrap().unwrap();
        let rx = provider.tx.subscribe();
        let before = rx.borrow().cert[0].as_ref().to_vec();

        let token = CancellationToken::new();
        let handle = tokio::spawn(provider.watch(token.clone()));

        // Give the watcher time to register, then rotate.
        tokio::time::sleep(Duration::from_millis(200)).await;
        write_pair(dir.path());

        // Wait past the debounce window for the swap.
        let mut swapped = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if rx.borrow().cert[0].as_ref() != before.as_slice() {
                swapped = true;
                break;
            }
        }

        token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        assert!(swapped, "watcher should have swapped in the rotated pair");
    }
}
