//! STARTTLS acceptor construction from PEM material.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFiles;
use crate::error::ConfigError;

/// Build an acceptor from a PEM certificate chain and private key.
///
/// TLS 1.2 is the oldest protocol version offered.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ConfigError> {
    let certificates = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("loading certificates: {e}")))?;
    if certificates.is_empty() {
        return Err(ConfigError::Tls("no certificates found".to_string()));
    }

    let private_key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| ConfigError::Tls(format!("loading private key: {e}")))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&TLS13, &TLS12])
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Read both PEM files and build the acceptor.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, ConfigError> {
    let read = |path: &Path| {
        std::fs::read(path)
            .map_err(|e| ConfigError::Tls(format!("reading {}: {e}", path.display())))
    };
    acceptor_from_pem(&read(&files.cert_path)?, &read(&files.key_path)?)
}
