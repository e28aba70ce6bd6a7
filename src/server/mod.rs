//! Server supervisor: the top-level lifecycle state machine.
//!
//! One [`Server`] owns both listeners (application traffic and operational
//! metrics) plus the certificate watcher, and drives them through an
//! ordered lifecycle:
//!
//! 1. startup, strictly sequential: TLS config, app listener, metrics
//!    listener, certificate watcher - a later failure tears down every
//!    earlier resource;
//! 2. steady state: block until the caller's cancellation token fires, a
//!    serve loop dies (fatal), or the watcher errors (fatal);
//! 3. shutdown, strictly reverse: metrics listener before app listener,
//!    each under its own drain budget, then the watcher, then every
//!    background task is joined before `run` returns.
//!
//! `run` admits at most one concurrent invocation, guarded by an atomic
//! compare-and-swap that resets on every exit path.

mod listener;
mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthState;
use crate::config::Config;
use crate::tls::{self, TlsContext};
use crate::{Error, Result, metrics};

use listener::{Listener, resolve_addr};

/// Drain budget for the application server on shutdown.
const APP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain budget for the metrics server on shutdown. Short: losing a scrape
/// is cheaper than holding up process exit.
const METRICS_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Addresses the listeners are currently bound to. Empty while not running.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundAddrs {
    /// Application listener address
    pub app: Option<SocketAddr>,
    /// Metrics listener address
    pub metrics: Option<SocketAddr>,
}

/// The forward-auth gateway server.
pub struct Server {
    config: Arc<Config>,
    app_router: Router,
    metrics_router: Option<Router>,
    tls: Option<TlsContext>,
    running: AtomicBool,
    bound: watch::Sender<BoundAddrs>,
}

impl Server {
    /// Create a new server: resolve TLS material, install the metrics
    /// recorder when enabled, and wire both route tables.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid TLS or auth configuration.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let auth = Arc::new(AuthState::new(config.clone())?);

        let tls = tls::load(&config)?;

        let metrics_router = if config.metrics.enabled {
            let handle = metrics::init()?;
            Some(router::build_metrics_router(handle))
        } else {
            None
        };

        let app_router = router::build_app_router(auth);
        let (bound, _) = watch::channel(BoundAddrs::default());

        Ok(Self {
            config,
            app_router,
            metrics_router,
            tls,
            running: AtomicBool::new(false),
            bound,
        })
    }

    /// Run the server until `shutdown` fires.
    ///
    /// Blocking call; returns `Ok(())` after a clean, ordered shutdown.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] when a run is already in progress
    /// - startup errors (bind failure, watcher start failure), with every
    ///   already-started component torn down
    /// - fatal runtime errors: a serve loop or the certificate watcher
    ///   dying while believed to be running
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        // Reset the flag on every exit path, panics included.
        let _guard = RunningGuard(&self.running);

        self.run_inner(shutdown).await
    }

    /// Addresses of the currently bound listeners.
    #[must_use]
    pub fn bound_addrs(&self) -> BoundAddrs {
        *self.bound.borrow()
    }

    /// Wait until the application listener is serving and return the bound
    /// addresses. Intended for tests and embedders starting `run` on a
    /// separate task.
    pub async fn serving_addrs(&self) -> BoundAddrs {
        let mut rx = self.bound.subscribe();
        rx.wait_for(|b| b.app.is_some())
            .await
            .map(|b| *b)
            .unwrap_or_default()
    }

    async fn run_inner(&self, shutdown: CancellationToken) -> Result<()> {
        let config = &self.config;

        // Resolve both bind addresses up front so no resource is acquired
        // when either is unusable.
        let app_addr = resolve_addr(&config.server.bind, config.server.port)?;
        let metrics_addr = if self.metrics_router.is_some() {
            Some(resolve_addr(&config.metrics.bind, config.metrics.port)?)
        } else {
            None
        };

        // App listener.
        let tls_config = self
            .tls
            .as_ref()
            .map(|t| RustlsConfig::from_config(t.server_config.clone()));
        let mut app = Listener::start(
            "app",
            app_addr,
            self.app_router.clone(),
            tls_config,
            APP_SHUTDOWN_TIMEOUT,
        )
        .await?;

        // Metrics listener; on failure the app listener must not leak.
        let mut metrics_listener = match (&self.metrics_router, metrics_addr) {
            (Some(router), Some(addr)) => {
                match Listener::start(
                    "metrics",
                    addr,
                    router.clone(),
                    None,
                    METRICS_SHUTDOWN_TIMEOUT,
                )
                .await
                {
                    Ok(l) => Some(l),
                    Err(e) => {
                        app.shutdown().await;
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        self.bound.send_replace(BoundAddrs {
            app: Some(app.local_addr()),
            metrics: metrics_listener.as_ref().map(Listener::local_addr),
        });

        // Certificate watcher. A child token lets the fatal paths stop the
        // watcher even though the caller's token never fired.
        let watch_token = shutdown.child_token();
        let mut watch_task: Option<JoinHandle<Result<()>>> = self
            .tls
            .as_ref()
            .and_then(|t| t.provider.clone())
            .map(|provider| {
                let token = watch_token.clone();
                tokio::spawn(async move { provider.watch(token).await })
            });

        // Steady state: block until cancellation or a fatal event.
        let exit = tokio::select! {
            () = shutdown.cancelled() => {
                info!("Shutdown signal received");
                Ok(())
            }
            detail = app.serve_exited() => {
                Err(Error::Server(format!("app server exited unexpectedly: {detail}")))
            }
            detail = serve_exited_opt(&mut metrics_listener) => {
                Err(Error::Server(format!("metrics server exited unexpectedly: {detail}")))
            }
            res = watch_exited(&mut watch_task) => res,
        };

        // Ordered shutdown, reverse of acquisition: metrics first, app
        // second, watcher last; every task is joined before returning.
        if let Some(listener) = metrics_listener.take() {
            listener.shutdown().await;
        }
        app.shutdown().await;

        watch_token.cancel();
        if let Some(task) = watch_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Certificate watcher error during shutdown");
                }
                Err(e) => {
                    warn!(error = %e, "Certificate watcher task join error");
                }
            }
        }

        self.bound.send_replace(BoundAddrs::default());

        exit
    }
}

/// Resets the running flag when `run` unwinds, whatever the exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Like [`Listener::serve_exited`], pending forever when no listener exists.
async fn serve_exited_opt(listener: &mut Option<Listener>) -> String {
    match listener {
        Some(l) => l.serve_exited().await,
        None => std::future::pending().await,
    }
}

/// Resolves when the watcher task finishes. `Ok(())` means it observed the
/// cancellation; anything else is fatal to the run.
async fn watch_exited(task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match task {
        Some(handle) => {
            let result = match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::CertWatch(format!("watcher task panicked: {e}"))),
            };
            *task = None;
            result
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ProviderKind, SessionConfig};

    use super::*;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.auth.provider = ProviderKind::Seamless;
        config.session = SessionConfig {
            secret: Some("test".to_string()),
            ..SessionConfig::default()
        };
        Arc::new(config)
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let server = Arc::new(Server::new(test_config()).unwrap());
        let token = CancellationToken::new();

        let first = {
            let server = Arc::clone(&server);
            let token = token.clone();
            tokio::spawn(async move { server.run(token).await })
        };
        server.serving_addrs().await;

        let second = server.run(CancellationToken::new()).await;
        assert!(matches!(second, Err(Error::AlreadyRunning)));

        token.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_can_be_repeated_after_clean_shutdown() {
        let server = Arc::new(Server::new(test_config()).unwrap());

        for _ in 0..2 {
            let token = CancellationToken::new();
            let task = {
                let server = Arc::clone(&server);
                let token = token.clone();
                tokio::spawn(async move { server.run(token).await })
            };
            server.serving_addrs().await;
            token.cancel();
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn run_returns_only_after_listeners_closed() {
        let server = Arc::new(Server::new(test_config()).unwrap());
        let token = CancellationToken::new();

        let task = {
            let server = Arc::clone(&server);
            let token = token.clone();
            tokio::spawn(async move { server.run(token).await })
        };
        let addrs = server.serving_addrs().await;
        let addr = addrs.app.unwrap();

        token.cancel();
        task.await.unwrap().unwrap();

        // The port is released once run returns.
        assert!(server.bound_addrs().app.is_none());
        let rebind = std::net::TcpListener::bind(addr);
        assert!(rebind.is_ok(), "app port should be released after run");
    }

    #[tokio::test]
    async fn bind_conflict_is_a_startup_error() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = addr.port();
        config.auth.provider = ProviderKind::Seamless;
        let server = Server::new(Arc::new(config)).unwrap();

        let result = server.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Server(_))));
        // The running flag was reset by the failed run.
        let result = server.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Server(_))));
    }
}
