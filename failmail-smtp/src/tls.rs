//! TLS material loading for the listener's STARTTLS support.

use std::{fs::File, io, io::BufReader, path::Path, sync::Arc};

use thiserror::Error;
use tokio_rustls::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
pub use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load TLS certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let open = |path: &Path| -> io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    };

    open(path).map_err(|source| TlsError::CertificateLoad {
        path: path.display().to_string(),
        source,
    })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key_error = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let mut reader =
        BufReader::new(File::open(path).map_err(|e| key_error(e.to_string()))?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| key_error(e.to_string()))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(key_error(
            "unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        )),
    }
}

/// Build the acceptor for STARTTLS upgrades. Loaded once at startup; the
/// configuration is read-only afterwards.
///
/// # Errors
/// If either PEM file cannot be loaded or rustls rejects the pair.
pub fn acceptor(certificate: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(certificate)?, load_key(key)?)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_a_load_error() {
        let missing = Path::new("/does-not-exist/cert.pem");
        assert!(matches!(
            load_certs(missing),
            Err(TlsError::CertificateLoad { .. })
        ));
    }

    #[test]
    fn garbage_key_material_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        std::fs::write(&key_path, "not a key").unwrap();

        assert!(matches!(load_key(&key_path), Err(TlsError::KeyLoad { .. })));
    }
}
