//! TLS termination with optional client certificates.
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};

use futures::future::BoxFuture;

use rustls::server::AllowAnyAnonymousOrAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use tower_http::add_extension::AddExtension;

/// The DER certificate chain presented by the peer of a TLS connection, leaf first.
///
/// Empty when the client connected anonymously.
#[derive(Clone, Debug, Default)]
pub struct PeerCertificates(Arc<Vec<Vec<u8>>>);

impl PeerCertificates {
    pub fn new(chain: Vec<Vec<u8>>) -> Self {
        Self(Arc::new(chain))
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(|c| c.as_slice())
    }
}

/// Extract the subject common name of a DER-encoded certificate.
pub fn common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| anyhow!("invalid certificate: {}", e))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| anyhow!("certificate has no common name"))?
        .as_str()
        .map_err(|e| anyhow!("invalid common name: {}", e))?;

    Ok(cn.to_string())
}

pub fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate in {:?}", path.as_ref()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| anyhow!("no private key in {:?}", path.as_ref()))
}

/// Build a rustls server configuration.
///
/// When a client CA is provided, clients may present a certificate, which must chain to
/// that CA. Anonymous clients are still accepted and are rejected later by the routes
/// requiring an identity.
pub fn server_config<P: AsRef<Path>>(
    certificate: P,
    private_key: P,
    client_ca: Option<P>,
) -> Result<RustlsConfig> {
    let certs = load_certs(certificate)?;
    let key = load_private_key(private_key)?;

    let builder = ServerConfig::builder().with_safe_defaults();
    let mut config = if let Some(ca) = client_ca {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots.add(&cert)?;
        }
        builder
            .with_client_cert_verifier(AllowAnyAnonymousOrAuthenticatedClient::new(roots))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// A TLS acceptor that exposes the client certificate chain to request handlers.
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
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
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let (_, session) = stream.get_ref();
            let chain = session
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.0.clone()).collect::<Vec<_>>())
                .unwrap_or_default();

            let peer = PeerCertificates::new(chain);
            Ok((stream, AddExtension::new(service, peer)))
        })
    }
}
