//! One managed listener: bind, serve in the background, shut down within a
//! bounded budget.
//!
//! Lifecycle: `start` binds and begins serving (a bind failure is returned
//! to the caller and leaves no task behind); `serve_exited` resolves if the
//! serve loop dies, which the supervisor treats as fatal; `shutdown`
//! performs one bounded graceful-drain attempt and joins the task.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::tls::accept::ClientCertAcceptor;
use crate::{Error, Result};

/// A bound, serving listener.
pub(crate) struct Listener {
    name: &'static str,
    addr: SocketAddr,
    handle: Handle<SocketAddr>,
    task: Option<JoinHandle<io::Result<()>>>,
    shutdown_timeout: Duration,
}

impl Listener {
    /// Bind `addr` and start serving `app` on a background task.
    ///
    /// With a TLS config, connections are accepted through the
    /// client-certificate-capturing acceptor; without one the server speaks
    /// cleartext and still accepts HTTP/2 (prior-knowledge upgrade via the
    /// auto-detecting connection builder).
    ///
    /// Resolves once the listener is bound. A bind failure is returned
    /// here, after the failed task has been joined - the caller never ends
    /// up believing a dead listener is running.
    pub(crate) async fn start(
        name: &'static str,
        addr: SocketAddr,
        app: Router,
        tls: Option<RustlsConfig>,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let handle = Handle::new();
        let uses_tls = tls.is_some();

        let task: JoinHandle<io::Result<()>> = match tls {
            Some(config) => {
                let acceptor = ClientCertAcceptor::new(config);
                let server = axum_server::bind(addr)
                    .acceptor(acceptor)
                    .handle(handle.clone());
                tokio::spawn(server.serve(app.into_make_service()))
            }
            None => {
                let server = axum_server::bind(addr).handle(handle.clone());
                tokio::spawn(server.serve(app.into_make_service()))
            }
        };

        match handle.listening().await {
            Some(bound) => {
                info!(server = name, addr = %bound, tls = uses_tls, "Server started");
                Ok(Self {
                    name,
                    addr: bound,
                    handle,
                    task: Some(task),
                    shutdown_timeout,
                })
            }
            None => {
                // The serve task exited before binding; surface its error.
                let detail = match task.await {
                    Ok(Err(e)) => e.to_string(),
                    Ok(Ok(())) => "listener closed before binding".to_string(),
                    Err(e) => format!("serve task panicked: {e}"),
                };
                Err(Error::Server(format!(
                    "failed to start {name} server on {addr}: {detail}"
                )))
            }
        }
    }

    /// The address the listener is actually bound to.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves with a description if the serve loop exits.
    ///
    /// Any completion here means the listener died without a shutdown
    /// request - the supervisor escalates it. Cancel-safe: if another
    /// branch wins the race, the task stays joinable.
    pub(crate) async fn serve_exited(&mut self) -> String {
        match &mut self.task {
            Some(task) => {
                let detail = match task.await {
                    Ok(Ok(())) => "serve loop exited without a shutdown request".to_string(),
                    Ok(Err(e)) => format!("serve error: {e}"),
                    Err(e) => format!("serve task panicked: {e}"),
                };
                self.task = None;
                detail
            }
            None => std::future::pending().await,
        }
    }

    /// One bounded graceful-shutdown attempt, then join the serve task.
    ///
    /// In-flight requests get at most the configured timeout before the
    /// remaining connections are closed. Shutdown-time errors are logged,
    /// not escalated - shutdown is best-effort once requested.
    pub(crate) async fn shutdown(mut self) {
        info!(server = self.name, "Shutting down server");
        self.handle.graceful_shutdown(Some(self.shutdown_timeout));

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(server = self.name, error = %e, "Server shutdown error");
                }
                Err(e) => {
                    warn!(server = self.name, error = %e, "Server task join error");
                }
            }
        }
    }
}

/// Resolve a configured `bind`/`port` pair to a socket address.
pub(crate) fn resolve_addr(bind: &str, port: u16) -> Result<SocketAddr> {
    (bind, port)
        .to_socket_addrs()
        .map_err(|e| Error::Server(format!("cannot resolve bind address '{bind}:{port}': {e}")))?
        .next()
        .ok_or_else(|| {
            Error::Server(format!("bind address '{bind}:{port}' resolved to nothing"))
        })
}
