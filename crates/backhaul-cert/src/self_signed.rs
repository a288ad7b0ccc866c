//! Ephemeral identity for the proxy
//!
//! Bridges do not check the proxy's certificate chain, so a certificate
//! generated at startup is enough to run the session over TLS 1.3.

use rcgen::{CertificateParams, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::Certificate;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Cannot issue certificate: {0}")]
    Issue(#[from] rcgen::Error),

    #[error("Generated key is unusable: {0}")]
    Key(String),
}

/// Names the default certificate is issued for
pub const LOCAL_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

const VALIDITY_DAYS: i64 = 90;

/// A freshly issued certificate with its key, in DER and PEM
pub struct SelfSigned {
    pub certificate: Certificate,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issue a certificate for [`LOCAL_NAMES`]
pub fn self_signed_local() -> Result<SelfSigned, SelfSignedError> {
    self_signed_for(LOCAL_NAMES)
}

/// Issue a certificate for `names`
///
/// Names that parse as IP addresses become IP SANs, the rest DNS SANs.
pub fn self_signed_for(names: &[&str]) -> Result<SelfSigned, SelfSignedError> {
    let params = params_for(names)?;
    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| SelfSignedError::Key(e.to_string()))?;
    let chain = vec![CertificateDer::from(cert.der().to_vec())];

    Ok(SelfSigned {
        certificate: Certificate::new(chain, private_key),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn params_for(names: &[&str]) -> Result<CertificateParams, SelfSignedError> {
    let mut params =
        CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())?;

    params.distinguished_name.push(DnType::CommonName, "backhaul proxy");
    params.distinguished_name.push(DnType::OrganizationName, "backhaul");

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    Ok(params)
}
