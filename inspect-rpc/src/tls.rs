//! TLS termination for the listener.
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::Result;
use crate::error::ServerError;

/// Build a server config from a PEM certificate chain and a PEM private key, advertising HTTP/2
/// and HTTP/1.1 over ALPN.
pub fn server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig> {
    let certs = load_certificates(cert_file)?;
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|source| ServerError::TlsPrivateKey {
        path: key_file.to_path_buf(),
        source,
    })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

pub fn acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(cert_file, key_file)?)))
}

fn load_certificates(cert_file: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let to_error = |source| ServerError::TlsCertificate {
        path: cert_file.to_path_buf(),
        source,
    };

    let certs = CertificateDer::pem_file_iter(cert_file)
        .map_err(to_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(to_error)?;

    if certs.is_empty() {
        return Err(to_error(rustls::pki_types::pem::Error::NoItemsFound));
    }

    Ok(certs)
}
