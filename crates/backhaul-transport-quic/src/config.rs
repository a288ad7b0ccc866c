//! Endpoint settings for the session
//!
//! The proxy presents a certificate from `backhaul-cert`; the bridge accepts
//! whatever certificate the proxy presents and only checks that the
//! handshake is signed by its key.

use backhaul_cert::Certificate;
use backhaul_transport::{TransportError, TransportResult, SESSION_ALPN};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::ensure_crypto_provider;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_BIDI_STREAMS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Certificate presented when this endpoint accepts sessions
    identity: Option<Certificate>,

    pub alpn: Vec<String>,
    pub keep_alive_interval: Duration,
    pub idle_timeout: Duration,

    /// Streams the peer may have open at once
    pub max_bidi_streams: u32,
}

impl QuicConfig {
    /// Dialing side; trusts any proxy certificate
    pub fn bridge() -> Self {
        Self {
            identity: None,
            alpn: vec![SESSION_ALPN.to_string()],
            keep_alive_interval: KEEP_ALIVE,
            idle_timeout: BRIDGE_IDLE_TIMEOUT,
            max_bidi_streams: MAX_BIDI_STREAMS,
        }
    }

    /// Accepting side presenting `certificate`
    pub fn proxy(certificate: Certificate) -> Self {
        Self {
            identity: Some(certificate),
            idle_timeout: PROXY_IDLE_TIMEOUT,
            ..Self::bridge()
        }
    }

    pub fn proxy_from_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> TransportResult<Self> {
        let certificate = Certificate::from_pem_files(cert_path, key_path)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Self::proxy(certificate))
    }

    /// Proxy with a certificate generated for this process only
    pub fn proxy_self_signed() -> TransportResult<Self> {
        let certificate = Certificate::self_signed()
            .map_err(|e| TransportError::Tls(format!("self-signed certificate: {}", e)))?;
        Ok(Self::proxy(certificate))
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = vec![alpn.into()];
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::Config(
                "keep-alive interval must be non-zero".to_string(),
            ));
        }
        // Keep-alives must be able to hold the session open
        if self.idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::Config(format!(
                "idle timeout {:?} is shorter than two keep-alive intervals ({:?})",
                self.idle_timeout, self.keep_alive_interval
            )));
        }
        if self.alpn.is_empty() {
            return Err(TransportError::Config("no ALPN protocol set".to_string()));
        }
        Ok(())
    }

    pub(crate) fn client_config(&self) -> TransportResult<quinn::ClientConfig> {
        ensure_crypto_provider();

        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(AcceptAnyServerCert::new())
            .with_no_client_auth();
        crypto.alpn_protocols = self.alpn_wire();

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport()?));
        Ok(config)
    }

    pub(crate) fn server_config(&self) -> TransportResult<quinn::ServerConfig> {
        ensure_crypto_provider();

        let identity = self.identity.clone().ok_or_else(|| {
            TransportError::Config("accepting sessions requires a certificate".to_string())
        })?;

        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.private_key)
            .map_err(|e| TransportError::Tls(format!("certificate rejected: {}", e)))?;
        crypto.alpn_protocols = self.alpn_wire();

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport()?));
        Ok(config)
    }

    fn alpn_wire(&self) -> Vec<Vec<u8>> {
        self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    fn transport(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout)
            .map_err(|e| TransportError::Config(format!("idle timeout: {}", e)))?;

        let mut transport = quinn::TransportConfig::default();
        transport
            .keep_alive_interval(Some(self.keep_alive_interval))
            .max_idle_timeout(Some(idle))
            .max_concurrent_bidi_streams(self.max_bidi_streams.into())
            .max_concurrent_uni_streams(0u32.into());
        Ok(transport)
    }
}

/// Skips chain and name checks but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_defaults() {
        let config = QuicConfig::bridge();
        assert!(!config.has_identity());
        assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.alpn, vec!["quic-tunnel"]);
        assert!(config.validate().is_ok());
        assert!(config.client_config().is_ok());
    }

    #[test]
    fn test_proxy_self_signed_has_identity() {
        let config = QuicConfig::proxy_self_signed().unwrap();
        assert!(config.has_identity());
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert!(config.validate().is_ok());
        assert!(config.server_config().is_ok());
    }

    #[test]
    fn test_idle_timeout_must_cover_keep_alive() {
        let config = QuicConfig::bridge().with_idle_timeout(Duration::from_secs(9));
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }

    #[test]
    fn test_empty_alpn_rejected() {
        let mut config = QuicConfig::bridge();
        config.alpn.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bridge_cannot_accept_sessions() {
        assert!(matches!(
            QuicConfig::bridge().server_config(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_missing_pem_files() {
        let err = QuicConfig::proxy_from_pem("/nonexistent.crt", "/nonexistent.key").unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
