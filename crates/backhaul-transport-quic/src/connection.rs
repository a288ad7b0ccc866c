//! A session as one QUIC connection

use async_trait::async_trait;
use backhaul_transport::{TransportConnection, TransportError, TransportResult};
use quinn::{ConnectionError, VarInt};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::stream::QuicStream;

#[derive(Debug, Clone)]
pub struct QuicConnection {
    conn: quinn::Connection,
    id: String,
}

impl QuicConnection {
    pub(crate) fn new(conn: quinn::Connection) -> Self {
        let id = format!("quic-{}", conn.stable_id());
        Self { conn, id }
    }
}

/// Errors after which the connection will never yield another stream
fn session_ended(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::TimedOut
            | ConnectionError::Reset
    )
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<QuicStream> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(format!("open on {}: {}", self.id, e)))?;
        let stream = QuicStream::new(send, recv);
        trace!(connection_id = %self.id, stream_id = stream.id(), "Opened stream");
        Ok(stream)
    }

    async fn accept_stream(&self) -> TransportResult<Option<QuicStream>> {
        match self.conn.accept_bi().await {
            Ok((send, recv)) => {
                let stream = QuicStream::new(send, recv);
                trace!(connection_id = %self.id, stream_id = stream.id(), "Accepted stream");
                Ok(Some(stream))
            }
            Err(e) if session_ended(&e) || self.is_closed() => {
                debug!(connection_id = %self.id, reason = %e, "No more streams");
                Ok(None)
            }
            Err(e) => Err(TransportError::Stream(format!(
                "accept on {}: {}",
                self.id, e
            ))),
        }
    }

    async fn close(&self, code: u32, reason: &str) {
        self.conn.close(VarInt::from_u32(code), reason.as_bytes());
        debug!(connection_id = %self.id, code, reason, "Closed session");
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }
}
