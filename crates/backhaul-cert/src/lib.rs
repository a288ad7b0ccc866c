//! Certificate provider for the proxy's session endpoint
//!
//! Supplies the TLS identity the QUIC listener presents: either a PEM
//! certificate/key pair loaded from disk or an ephemeral self-signed one.

pub mod self_signed;

pub use self_signed::{
    self_signed_for, self_signed_local, SelfSigned, SelfSignedError, LOCAL_NAMES,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors loading certificate material
#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error(transparent)]
    SelfSigned(#[from] SelfSignedError),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Load a PEM certificate chain and private key from disk
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CertError> {
        let cert_chain = load_certs(cert_path.as_ref())?;
        let private_key = load_private_key(key_path.as_ref())?;

        debug!(
            certs = cert_chain.len(),
            path = %cert_path.as_ref().display(),
            "Loaded certificate chain"
        );

        Ok(Self::new(cert_chain, private_key))
    }

    /// Generate a fresh self-signed identity for the local names
    pub fn self_signed() -> Result<Self, CertError> {
        Ok(self_signed_local()?.certificate)
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(path.display().to_string()));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "backhaul-cert-test-{}-{}",
            std::process::id(),
            name
        ))
    }

    #[test]
    fn test_round_trip_through_pem_files() {
        let issued = self_signed_local().unwrap();
        let cert_path = temp_path("roundtrip.crt");
        let key_path = temp_path("roundtrip.key");
        std::fs::write(&cert_path, &issued.cert_pem).unwrap();
        std::fs::write(&key_path, &issued.key_pem).unwrap();

        let loaded = Certificate::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.cert_chain, issued.certificate.cert_chain);

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Certificate::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, CertError::Open { .. }));
    }

    #[test]
    fn test_key_file_without_key() {
        let issued = self_signed_local().unwrap();
        let cert_path = temp_path("nokey.crt");
        std::fs::write(&cert_path, &issued.cert_pem).unwrap();

        // The certificate file holds no private key block
        let err = Certificate::from_pem_files(&cert_path, &cert_path).unwrap_err();
        assert!(matches!(err, CertError::NoPrivateKey(_)));

        let _ = std::fs::remove_file(cert_path);
    }

    #[test]
    fn test_clone_keeps_key_material() {
        let cert = Certificate::self_signed().unwrap();
        let cloned = cert.clone();
        assert_eq!(
            cert.private_key.secret_der(),
            cloned.private_key.secret_der()
        );
    }
}
