//! Certificate loading for https listeners.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// Connections are served by an HTTP/1 connection driver only.
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Load a certificate chain and private key into a handshake acceptor.
pub async fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ServerError> {
    for (what, path) in [("certificate", cert_path), ("private key", key_path)] {
        if !path.is_file() {
            return Err(ServerError::Tls(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{what} {} does not exist", path.display()),
            )));
        }
    }

    let config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(ServerError::Tls)?;
    let mut server = (*config.get_inner()).clone();
    server.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    tracing::debug!(cert = %cert_path.display(), "Loaded TLS certificate");
    Ok(TlsAcceptor::from(Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        assert!(matches!(
            load_tls_acceptor(&cert, &key).await,
            Err(ServerError::Tls(_))
        ));

        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();
        assert!(load_tls_acceptor(&cert, &key).await.is_err());
    }

    #[tokio::test]
    async fn test_acceptor_offers_http1_only() {
        let dir = tempfile::tempdir().unwrap();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let acceptor = load_tls_acceptor(&cert_path, &key_path).await.unwrap();
        assert_eq!(acceptor.config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
