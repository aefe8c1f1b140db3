//! TLS acceptor for the encrypted roles.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use waypost_types::error::{WaypostError, WaypostResult};

/// Build an acceptor from a PEM certificate chain and a PEM private key.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> WaypostResult<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        WaypostError::Config(format!("cannot open TLS certificate {}: {e}", cert_path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WaypostError::Config(format!("bad TLS certificate: {e}")))?;
    if certs.is_empty() {
        return Err(WaypostError::Config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        WaypostError::Config(format!("cannot open TLS key {}: {e}", key_path.display()))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| WaypostError::Config(format!("bad TLS key: {e}")))?
        .ok_or_else(|| {
            WaypostError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    info!(cert = %cert_path.display(), "Loaded TLS certificate");
    tls_acceptor_from_der(certs, key)
}

/// Build an acceptor from DER material.
pub fn tls_acceptor_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> WaypostResult<TlsAcceptor> {
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| WaypostError::Config(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WaypostError::Config(format!("TLS certificate rejected: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
