//! QUIC session transport on quinn
//!
//! One QUIC connection is one session. The heartbeat channel and every
//! tunneled TCP connection are bidirectional streams inside it.
//!
//! ```no_run
//! use backhaul_transport_quic::{QuicConfig, QuicConnector, QuicListener};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = QuicListener::new(
//!     "0.0.0.0:4433".parse()?,
//!     Arc::new(QuicConfig::proxy_self_signed()?),
//! )?;
//! let bridge = QuicConnector::new(Arc::new(QuicConfig::bridge()))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::QuicStream;

static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

/// Install ring as the process-wide rustls provider
///
/// Must run before any TLS configuration is built. Safe to call repeatedly.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("A rustls crypto provider was already installed");
        }
    });
}
