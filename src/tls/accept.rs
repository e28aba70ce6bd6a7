//! TLS acceptor that exposes the verified client certificate to routes.
//!
//! rustls validates client certificates during the handshake (verify-if-given
//! mode); this acceptor captures the result per connection and injects it as
//! a request extension, so route middleware can enforce presence on the
//! subset of routes that needs mutual TLS.

use std::io;
use std::task::{Context, Poll};

use axum::http::Request;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Service;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Identity captured from the TLS handshake for one connection.
///
/// Present on every request served over TLS. `presented` is `false` when the
/// client completed the handshake without offering a certificate (allowed in
/// verify-if-given mode).
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// Whether the client presented a (verified) certificate
    pub presented: bool,
    /// Certificate Common Name, if one was presented and parseable
    pub common_name: Option<String>,
}

impl PeerIdentity {
    /// Extract the identity from the handshake's verified certificate chain.
    #[must_use]
    pub fn from_certs(certs: Option<&[CertificateDer<'_>]>) -> Self {
        let Some(leaf) = certs.and_then(|chain| chain.first()) else {
            return Self::default();
        };

        let common_name = X509Certificate::from_der(leaf.as_ref())
            .ok()
            .and_then(|(_, cert)| {
                cert.subject()
                    .iter_common_name()
                    .next()
                    .and_then(|attr| attr.as_str().ok())
                    .map(str::to_owned)
            });

        Self {
            presented: true,
            common_name,
        }
    }
}

/// `axum_server` acceptor wrapping [`RustlsAcceptor`], tagging each
/// connection's service with the peer's [`PeerIdentity`].
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
    /// Create an acceptor for the given rustls config.
    #[must_use]
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = WithPeerIdentity<S>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let (_, session) = stream.get_ref();
            let identity = PeerIdentity::from_certs(session.peer_certificates());

            Ok((stream, WithPeerIdentity { inner: service, identity }))
        })
    }
}

/// Per-connection service wrapper inserting the [`PeerIdentity`] extension
/// into every request.
#[derive(Debug, Clone)]
pub struct WithPeerIdentity<S> {
    inner: S,
    identity: PeerIdentity,
}

impl<S, B> Service<Request<B>> for WithPeerIdentity<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.identity.clone());
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlsgen;

    #[test]
    fn no_certs_means_not_presented() {
        let identity = PeerIdentity::from_certs(None);
        assert!(!identity.presented);
        assert!(identity.common_name.is_none());

        let identity = PeerIdentity::from_certs(Some(&[]));
        assert!(!identity.presented);
    }

    #[test]
    fn presented_cert_yields_common_name() {
        let ca = tlsgen::generate_ca("Accept Test CA").unwrap();
        let client = tlsgen::generate_client_cert(&ca, "build-agent").unwrap();
        let der = crate::tls::parse_certs(client.cert_pem.as_bytes(), "test").unwrap();

        let identity = PeerIdentity::from_certs(Some(&der));
        assert!(identity.presented);
        assert_eq!(identity.common_name.as_deref(), Some("build-agent"));
    }

    #[test]
    fn unparseable_cert_still_counts_as_presented() {
        let garbage = [CertificateDer::from(vec![0u8; 16])];
        let identity = PeerIdentity::from_certs(Some(&garbage));
        assert!(identity.presented);
        assert!(identity.common_name.is_none());
    }
}
