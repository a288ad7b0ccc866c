//! Session transport seam for the backhaul tunnel
//!
//! The proxy accepts one multiplexed, encrypted session from the bridge and
//! both ends open and accept byte streams inside it. The tunnel engine only
//! sees the traits below; `backhaul-transport-quic` implements them on quinn.
//!
//! ```text
//!   Proxy ── TransportListener::accept ──┐
//!                                        ├── TransportConnection ── TransportStream*
//!   Bridge ─ TransportConnector::connect ┘
//! ```
//!
//! Streams carry raw bytes. Nothing here frames or inspects payload.

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

/// ALPN tag proxy and bridge negotiate
pub const SESSION_ALPN: &str = "quic-tunnel";

#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the remote endpoint failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// An incoming session failed its handshake; the listener stays usable
    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    /// Opening or accepting a stream failed on a live session
    #[error("Stream error: {0}")]
    Stream(String),

    /// The listener can never accept again
    #[error("Endpoint closed")]
    EndpointClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid transport configuration: {0}")]
    Config(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A byte stream inside a session
///
/// `AsyncWriteExt::shutdown` finishes the stream for the peer.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {
    /// Identifier unique within the owning session
    fn stream_id(&self) -> u64;
}

/// One established session
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    type Stream: TransportStream + 'static;

    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Next stream opened by the peer, `None` once the session is gone
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the session for both ends; `code` 0 is a normal closure
    async fn close(&self, code: u32, reason: &str);

    fn is_closed(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Identifier used in log lines
    fn connection_id(&self) -> String;
}

/// Accepts sessions (proxy side)
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Wait for the next session
    ///
    /// `TransportError::EndpointClosed` is terminal. Any other error belongs
    /// to a single incoming attempt and the caller may keep accepting.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting; pending and later `accept` calls return `EndpointClosed`
    async fn close(&self);
}

/// Dials sessions (bridge side)
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// `server_name` is sent as TLS SNI
    async fn connect(&self, addr: SocketAddr, server_name: &str)
        -> TransportResult<Self::Connection>;
}
