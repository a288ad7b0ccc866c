//! Session endpoints: the proxy's listener and the bridge's connector

use async_trait::async_trait;
use backhaul_transport::{TransportConnector, TransportError, TransportListener, TransportResult};
use quinn::Endpoint;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicListener {
    /// Bind a UDP socket at `bind_addr` and start accepting sessions
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;
        let endpoint = Endpoint::server(config.server_config()?, bind_addr)?;
        let local_addr = endpoint.local_addr()?;
        info!(%local_addr, "Accepting sessions (udp)");
        Ok(Self {
            endpoint,
            local_addr,
        })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(QuicConnection, SocketAddr)> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::EndpointClosed)?;
        let peer = incoming.remote_address();

        let conn = incoming.await.map_err(|e| {
            warn!(%peer, error = %e, "Session handshake failed");
            TransportError::Handshake {
                peer,
                reason: e.to_string(),
            }
        })?;

        debug!(%peer, "Session handshake complete");
        Ok((QuicConnection::new(conn), peer))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutting down");
        debug!(local_addr = %self.local_addr, "Session listener closed");
    }
}

/// Dials the proxy from one client endpoint
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;
        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(config.client_config()?);
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<QuicConnection> {
        let conn = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;

        info!(%addr, server_name, "Session established");
        Ok(QuicConnection::new(conn))
    }
}
