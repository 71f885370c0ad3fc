use std::fmt::Debug;

use apikit::reject::HTTPError;

use axum::extract::{FromRequest, RequestParts};

use serde::{Deserialize, Serialize};

use crate::tls::{common_name, PeerCertificates};

/// Name of a request header trusted to carry the caller's certificate common name.
///
/// Only honored on connections this server did not terminate TLS for (e.g. behind a proxy that
/// verified the client certificate). A TLS peer without a certificate stays anonymous.
#[derive(Clone, Debug)]
pub struct TrustedCnHeader(pub String);

/// The identity of a caller, as established by the common name of its client certificate.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClientIdentity {
    pub common_name: String,
}

impl ClientIdentity {
    fn from_peer_certificates(certs: &PeerCertificates) -> Result<Self, HTTPError> {
        let leaf = certs.leaf().ok_or_else(|| {
            tracing::debug!("tls connection without client certificate");
            HTTPError::Unauthorized
        })?;

        common_name(leaf)
            .map(|common_name| ClientIdentity { common_name })
            .map_err(|e| {
                tracing::debug!("bad client certificate: {}", e);
                HTTPError::Unauthorized
            })
    }

    fn from_trusted_header<B>(req: &RequestParts<B>) -> Option<Self> {
        let TrustedCnHeader(header_name) = req.extensions().get::<TrustedCnHeader>()?;
        let value = req.headers().get(header_name.as_str())?.to_str().ok()?;
        if value.is_empty() {
            return None;
        }
        tracing::debug!("got common name from trusted header");
        Some(ClientIdentity {
            common_name: value.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl<B: Send> FromRequest<B> for ClientIdentity {
    type Rejection = HTTPError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        if let Some(certs) = req.extensions().get::<PeerCertificates>() {
            return Self::from_peer_certificates(certs);
        }

        Self::from_trusted_header(req).ok_or_else(|| {
            tracing::debug!("no client identity found");
            HTTPError::Unauthorized
        })
    }
}

impl Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cn({})", &self.common_name)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    const HEADER: &str = "x-client-cn";

    async fn identify(peer: Option<PeerCertificates>) -> Result<ClientIdentity, HTTPError> {
        let mut req = RequestParts::new(Request::builder().header(HEADER, "alice").body(()).unwrap());
        req.extensions_mut().insert(TrustedCnHeader(HEADER.to_string()));
        if let Some(peer) = peer {
            req.extensions_mut().insert(peer);
        }
        ClientIdentity::from_request(&mut req).await
    }

    #[tokio::test]
    async fn header_is_trusted_without_tls() {
        let identity = identify(None).await.unwrap();
        assert_eq!(identity.common_name, "alice");
    }

    #[tokio::test]
    async fn tls_peer_without_certificate_cannot_use_the_header() {
        let r = identify(Some(PeerCertificates::new(Vec::new()))).await;
        assert!(matches!(r, Err(HTTPError::Unauthorized)));
    }

    #[tokio::test]
    async fn unreadable_certificate_is_rejected() {
        let r = identify(Some(PeerCertificates::new(vec![b"not a certificate".to_vec()]))).await;
        assert!(matches!(r, Err(HTTPError::Unauthorized)));
    }
}
