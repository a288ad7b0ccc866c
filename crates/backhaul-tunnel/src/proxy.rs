//! Proxy role
//!
//! Accepts the bridge's session on a UDP port and plain TCP clients on a
//! second port. Each client connection is carried to the bridge on a new
//! tunnel stream of the active session.

use backhaul_transport::{TransportConnection, TransportError, TransportListener, TransportStream};
use backhaul_transport_quic::{QuicConfig, QuicListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::failure::FailureCounter;
use crate::heartbeat::{receive_heartbeats, run_watchdog};
use crate::protocol::{read_role, write_role, StreamRole};
use crate::pump::DuplexPump;
use crate::session::{ActiveSession, SessionManager, SessionState};

/// Proxy bound to its session and client ports
pub struct Proxy<L: TransportListener> {
    config: ProxyConfig,
    listener: Arc<L>,
    clients: TcpListener,
    sessions: Arc<SessionManager<L::Connection>>,
    stream_failures: Arc<FailureCounter>,
}

impl Proxy<QuicListener> {
    /// Bind the QUIC session listener and the TCP client listener
    pub async fn bind(config: ProxyConfig, quic: Arc<QuicConfig>) -> Result<Self, ProxyError> {
        let listener =
            QuicListener::new(config.session_addr, quic).map_err(|e| ProxyError::SessionListener {
                address: config.session_addr.ip().to_string(),
                port: config.session_addr.port(),
                reason: e.to_string(),
            })?;

        Self::with_listener(config, listener).await
    }
}

impl<L> Proxy<L>
where
    L: TransportListener + 'static,
    L::Connection: 'static,
{
    /// Use an already bound session listener and bind the client port
    pub async fn with_listener(config: ProxyConfig, listener: L) -> Result<Self, ProxyError> {
        config.validate()?;

        let clients = TcpListener::bind(config.client_addr)
            .await
            .map_err(|e| ProxyError::ClientListener {
                address: config.client_addr.ip().to_string(),
                port: config.client_addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            config,
            listener: Arc::new(listener),
            clients,
            sessions: Arc::new(SessionManager::new()),
            stream_failures: Arc::new(FailureCounter::new()),
        })
    }

    pub fn session_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    pub fn client_addr(&self) -> std::io::Result<SocketAddr> {
        self.clients.local_addr()
    }

    pub fn sessions(&self) -> Arc<SessionManager<L::Connection>> {
        self.sessions.clone()
    }

    /// Run until cancelled or a fatal error occurs
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!(
            session_addr = ?self.session_addr().ok(),
            client_addr = ?self.client_addr().ok(),
            "Proxy running"
        );

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProxyError>(1);

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Proxy shutting down");
                Ok(())
            }
            _ = self.accept_sessions() => {
                let err = ProxyError::SessionListenerClosed {
                    address: self
                        .session_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| self.config.session_addr.to_string()),
                };
                error!("Proxy failed: {}", err);
                Err(err)
            }
            _ = run_watchdog(
                self.sessions.clone(),
                self.config.watchdog_interval,
                self.config.liveness_timeout,
            ) => Ok(()),
            _ = self.accept_clients(fatal_tx) => Ok(()),
            Some(err) = fatal_rx.recv() => {
                error!("Proxy failed: {}", err);
                Err(err)
            }
        };

        self.sessions.shutdown("proxy stopping").await;
        self.listener.close().await;

        result
    }

    /// Returns only once the listener can never accept again
    async fn accept_sessions(&self) {
        loop {
            match self.listener.accept().await {
                Ok((connection, peer)) => {
                    debug!(peer = %peer, "Accepted session");
                    let session = self.sessions.install(connection).await;
                    tokio::spawn(capture_heartbeat(
                        self.sessions.clone(),
                        session,
                        self.config.clone(),
                    ));
                }
                Err(TransportError::EndpointClosed) => return,
                Err(e) => {
                    warn!(error = %e, "Failed to accept session");
                }
            }
        }
    }

    async fn accept_clients(&self, fatal_tx: mpsc::Sender<ProxyError>) {
        loop {
            match self.clients.accept().await {
                Ok((socket, peer)) => {
                    let session = match self.sessions.current().await {
                        Some(session) if !session.is_closed() => session,
                        _ => {
                            info!(peer = %peer, "No active bridge session, closing client");
                            drop(socket);
                            continue;
                        }
                    };

                    tokio::spawn(dispatch_client(
                        socket,
                        peer,
                        session,
                        self.stream_failures.clone(),
                        self.config.clone(),
                        fatal_tx.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept client connection");
                    tokio::time::sleep(self.config.accept_error_backoff).await;
                }
            }
        }
    }
}

/// Install the heartbeat stream the bridge opens on `session`
///
/// Ends when the session's connection closes; a transport-level close tears
/// the session down instead of waiting for the watchdog.
async fn capture_heartbeat<C>(
    sessions: Arc<SessionManager<C>>,
    session: Arc<ActiveSession<C>>,
    config: ProxyConfig,
) where
    C: TransportConnection + 'static,
{
    loop {
        match session.connection().accept_stream().await {
            Ok(Some(mut stream)) => {
                let stream_id = stream.stream_id();
                match tokio::time::timeout(config.tag_read_timeout, read_role(&mut stream)).await {
                    Ok(Ok(StreamRole::Heartbeat)) => {
                        info!(session_id = session.id(), stream_id, "Heartbeat stream installed");
                        session.liveness().touch();
                        let reader = tokio::spawn(receive_heartbeats(
                            session.clone(),
                            stream,
                            config.heartbeat_retry_delay,
                        ));
                        session.install_heartbeat(stream_id, reader.abort_handle());
                    }
                    Ok(Ok(role)) => {
                        warn!(
                            session_id = session.id(),
                            stream_id,
                            role = ?role,
                            "Unexpected stream from bridge, dropping it"
                        );
                    }
                    Ok(Err(e)) => {
                        warn!(session_id = session.id(), stream_id, error = %e, "Dropping stream");
                    }
                    Err(_) => {
                        warn!(
                            session_id = session.id(),
                            stream_id, "Stream sent no role tag within {:?}, dropping it",
                            config.tag_read_timeout
                        );
                    }
                }
            }
            Ok(None) => {
                if sessions
                    .teardown_if_current(&session, SessionState::TransportError)
                    .await
                {
                    warn!(session_id = session.id(), "Session connection lost");
                }
                return;
            }
            Err(e) => {
                warn!(session_id = session.id(), error = %e, "Failed to accept stream");
                tokio::time::sleep(config.heartbeat_retry_delay).await;
            }
        }
    }
}

async fn dispatch_client<C>(
    socket: TcpStream,
    peer: SocketAddr,
    session: Arc<ActiveSession<C>>,
    failures: Arc<FailureCounter>,
    config: ProxyConfig,
    fatal_tx: mpsc::Sender<ProxyError>,
) where
    C: TransportConnection,
{
    let opened = tokio::time::timeout(
        config.stream_open_timeout,
        open_tunnel_stream(session.connection()),
    )
    .await;

    let stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            stream_open_failed(peer, &session, &failures, &config, &fatal_tx, e.to_string());
            return;
        }
        Err(_) => {
            let reason = format!("timed out after {:?}", config.stream_open_timeout);
            stream_open_failed(peer, &session, &failures, &config, &fatal_tx, reason);
            return;
        }
    };

    failures.reset();
    let stream_id = stream.stream_id();
    debug!(session_id = session.id(), stream_id, peer = %peer, "Tunnel stream opened");

    let report = DuplexPump::new("client->tunnel", "tunnel->client")
        .run(socket, stream)
        .await;

    debug!(
        session_id = session.id(),
        stream_id,
        peer = %peer,
        sent = report.forward_bytes,
        received = report.reverse_bytes,
        "Client connection finished"
    );
}

async fn open_tunnel_stream<C: TransportConnection>(
    connection: &C,
) -> Result<C::Stream, TransportError> {
    let mut stream = connection.open_stream().await?;
    write_role(&mut stream, StreamRole::Tunnel).await?;
    Ok(stream)
}

fn stream_open_failed<C: TransportConnection>(
    peer: SocketAddr,
    session: &ActiveSession<C>,
    failures: &FailureCounter,
    config: &ProxyConfig,
    fatal_tx: &mpsc::Sender<ProxyError>,
    reason: String,
) {
    let failures = failures.record();
    warn!(
        session_id = session.id(),
        peer = %peer,
        failures,
        reason = %reason,
        "Failed to open tunnel stream, closing client"
    );

    if failures > config.max_stream_open_failures {
        let _ = fatal_tx.try_send(ProxyError::ExcessiveStreamOpenFailures { failures });
    }
}
