//! Bridge role
//!
//! Dials the proxy once, opens the heartbeat stream, then serves every tunnel
//! stream the proxy opens by dialing the local target. The bridge never
//! reconnects: losing the session is returned as a fatal error.

use backhaul_transport::{TransportConnection, TransportConnector, TransportStream};
use backhaul_transport_quic::{QuicConfig, QuicConnector};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::heartbeat::HeartbeatSender;
use crate::protocol::{read_role, write_role, StreamRole};
use crate::pump::DuplexPump;
use crate::session::{SessionState, StateTracker};

/// A bridge with an established session and open heartbeat stream
pub struct BridgeAgent<K: TransportConnector> {
    config: BridgeConfig,
    // Keeps the client endpoint alive for the session's lifetime
    _connector: K,
    connection: Arc<K::Connection>,
    heartbeat: <K::Connection as TransportConnection>::Stream,
    state: StateTracker,
}

impl BridgeAgent<QuicConnector> {
    /// Dial the proxy over QUIC, trusting whatever certificate it presents
    pub async fn connect(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let quic = Arc::new(QuicConfig::bridge());
        let connector = QuicConnector::new(quic).map_err(|e| BridgeError::Connect {
            address: config.server_addr.clone(),
            reason: e.to_string(),
        })?;

        Self::establish(connector, config).await
    }
}

impl<K> BridgeAgent<K>
where
    K: TransportConnector,
    K::Connection: 'static,
{
    /// Establish the session and its heartbeat stream using `connector`
    pub async fn establish(connector: K, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let state = StateTracker::new();
        state.set(SessionState::Connecting);

        let address = config.server_addr.clone();
        info!(server = %address, target = %config.target_addr, "Connecting to proxy");

        let remote = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| BridgeError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BridgeError::Connect {
                address: address.clone(),
                reason: "address resolved to nothing".to_string(),
            })?;

        let server_name = config.server_name();
        let connection = match tokio::time::timeout(
            config.connect_timeout,
            connector.connect(remote, &server_name),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                state.set(SessionState::TransportError);
                return Err(BridgeError::Connect {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                state.set(SessionState::TransportError);
                return Err(BridgeError::ConnectTimeout {
                    address,
                    timeout: config.connect_timeout,
                });
            }
        };

        let heartbeat = match tokio::time::timeout(
            config.heartbeat_open_timeout,
            open_heartbeat_stream(&connection),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                connection.close(0, "heartbeat stream open failed").await;
                state.set(SessionState::TransportError);
                return Err(BridgeError::HeartbeatOpen {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                connection.close(0, "heartbeat stream open timed out").await;
                state.set(SessionState::TransportError);
                return Err(BridgeError::HeartbeatOpen {
                    reason: format!("timed out after {:?}", config.heartbeat_open_timeout),
                });
            }
        };

        state.set(SessionState::Established);
        info!(
            server = %address,
            connection_id = %connection.connection_id(),
            heartbeat_stream = heartbeat.stream_id(),
            "Session established"
        );

        Ok(Self {
            config,
            _connector: connector,
            connection: Arc::new(connection),
            heartbeat,
            state,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Serve tunnel streams until the session dies or `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let sender = HeartbeatSender::new(
            self.heartbeat,
            self.config.heartbeat_interval,
            self.config.max_heartbeat_failures,
        );

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Bridge shutting down");
                self.connection.close(0, "bridge stopping").await;
                self.state.set(SessionState::Disconnected);
                return Ok(());
            }
            err = sender.run() => Err(err),
            err = accept_tunnel_streams(self.connection.clone(), &self.config) => Err(err),
        };

        if let Err(e) = &result {
            warn!(error = %e, "Session lost");
            self.state.set(SessionState::TransportError);
        }
        self.connection.close(0, "bridge session failed").await;
        self.state.set(SessionState::Disconnected);

        result
    }
}

async fn open_heartbeat_stream<C: TransportConnection>(
    connection: &C,
) -> Result<C::Stream, backhaul_transport::TransportError> {
    let mut stream = connection.open_stream().await?;
    write_role(&mut stream, StreamRole::Heartbeat).await?;
    Ok(stream)
}

/// Accept streams opened by the proxy until the session closes
async fn accept_tunnel_streams<C>(connection: Arc<C>, config: &BridgeConfig) -> BridgeError
where
    C: TransportConnection + 'static,
{
    loop {
        match connection.accept_stream().await {
            Ok(Some(stream)) => {
                tokio::spawn(serve_tunnel_stream(stream, config.clone()));
            }
            Ok(None) => return BridgeError::SessionClosed,
            Err(e) => {
                warn!(error = %e, "Failed to accept tunnel stream");
                tokio::time::sleep(config.accept_retry_delay).await;
            }
        }
    }
}

async fn serve_tunnel_stream<S>(mut stream: S, config: BridgeConfig)
where
    S: TransportStream,
{
    let stream_id = stream.stream_id();

    match tokio::time::timeout(config.tag_read_timeout, read_role(&mut stream)).await {
        Ok(Ok(StreamRole::Tunnel)) => {}
        Ok(Ok(role)) => {
            warn!(stream_id, role = ?role, "Unexpected stream from proxy, dropping it");
            return;
        }
        Ok(Err(e)) => {
            warn!(stream_id, error = %e, "Dropping stream");
            return;
        }
        Err(_) => {
            warn!(stream_id, "Stream sent no role tag, dropping it");
            return;
        }
    }

    let target = &config.target_addr;
    let dialed = tokio::time::timeout(config.dial_timeout, TcpStream::connect(target)).await;
    let socket = match dialed {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!(stream_id, target = %target, error = %e, "Failed to connect to target");
            let _ = stream.shutdown().await;
            return;
        }
        Err(_) => {
            warn!(
                stream_id,
                target = %target,
                "Timed out connecting to target after {:?}",
                config.dial_timeout
            );
            let _ = stream.shutdown().await;
            return;
        }
    };

    debug!(stream_id, target = %target, "Connected to target, relaying");

    let report = DuplexPump::new("tunnel->target", "target->tunnel")
        .run(stream, socket)
        .await;

    debug!(
        stream_id,
        target = %target,
        to_target = report.forward_bytes,
        from_target = report.reverse_bytes,
        "Tunnel stream finished"
    );
}
