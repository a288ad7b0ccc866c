//! In-memory transport for tests
//!
//! `MockConnection::pair()` gives two connected ends; streams opened on one
//! end are accepted on the other and carried over `tokio::io::duplex` pipes.
//! Closing either end closes both, like a real session.

use super::*;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-memory stream
#[derive(Debug)]
pub struct MockStream {
    id: u64,
    pipe: DuplexStream,
}

impl TransportStream for MockStream {
    fn stream_id(&self) -> u64 {
        self.id
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().pipe).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_shutdown(cx)
    }
}

#[derive(Debug)]
struct Shared {
    closed: CancellationToken,
    close_reason: std::sync::Mutex<Option<String>>,
    next_stream_id: AtomicU64,
}

/// One end of an in-memory connection
#[derive(Debug, Clone)]
pub struct MockConnection {
    shared: Arc<Shared>,
    id: u64,
    remote: SocketAddr,
    peer_tx: mpsc::UnboundedSender<MockStream>,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<MockStream>>>,
    fail_opens: Arc<AtomicBool>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl MockConnection {
    /// Create two connected ends
    pub fn pair() -> (MockConnection, MockConnection) {
        let shared = Arc::new(Shared {
            closed: CancellationToken::new(),
            close_reason: std::sync::Mutex::new(None),
            next_stream_id: AtomicU64::new(0),
        });
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = MockConnection {
            shared: shared.clone(),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote: SocketAddr::from(([127, 0, 0, 1], 40001)),
            peer_tx: b_tx,
            incoming: Arc::new(Mutex::new(a_rx)),
            fail_opens: Arc::new(AtomicBool::new(false)),
        };
        let b = MockConnection {
            shared,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote: SocketAddr::from(([127, 0, 0, 1], 40002)),
            peer_tx: a_tx,
            incoming: Arc::new(Mutex::new(b_rx)),
            fail_opens: Arc::new(AtomicBool::new(false)),
        };
        (a, b)
    }

    /// Make every subsequent `open_stream` on this end fail
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Reason passed to `close`, if any
    pub fn close_reason(&self) -> Option<String> {
        self.shared
            .close_reason
            .lock()
            .map(|reason| reason.clone())
            .unwrap_or(None)
    }

    /// Resolves once either end has been closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    type Stream = MockStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.is_closed() {
            return Err(TransportError::Stream("connection closed".to_string()));
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(TransportError::Stream("stream open refused".to_string()));
        }

        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.peer_tx
            .send(MockStream { id, pipe: remote })
            .map_err(|_| TransportError::Stream("peer gone".to_string()))?;

        Ok(MockStream { id, pipe: local })
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shared.closed.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn close(&self, _error_code: u32, reason: &str) {
        if let Ok(mut slot) = self.shared.close_reason.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
        self.shared.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn connection_id(&self) -> String {
        format!("mock-{}", self.id)
    }
}

/// Listener fed by a `MockConnector`
#[derive(Debug)]
pub struct MockListener {
    incoming: Mutex<mpsc::UnboundedReceiver<TransportResult<MockConnection>>>,
    closed: CancellationToken,
    local: SocketAddr,
}

/// Connector that hands the server end of each new pair to its `MockListener`
#[derive(Debug, Clone)]
pub struct MockConnector {
    listener_tx: mpsc::UnboundedSender<TransportResult<MockConnection>>,
    refuse: Arc<AtomicBool>,
    fail_stream_opens: Arc<AtomicBool>,
}

impl MockListener {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MockListener, MockConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockListener {
                incoming: Mutex::new(rx),
                closed: CancellationToken::new(),
                local: SocketAddr::from(([127, 0, 0, 1], 4433)),
            },
            MockConnector {
                listener_tx: tx,
                refuse: Arc::new(AtomicBool::new(false)),
                fail_stream_opens: Arc::new(AtomicBool::new(false)),
            },
        )
    }
}

impl MockConnector {
    /// Make subsequent connects fail as if the server were unreachable
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Dialed connections refuse to open streams, as if the session died
    /// right after the handshake
    pub fn fail_stream_opens(&self, fail: bool) {
        self.fail_stream_opens.store(fail, Ordering::SeqCst);
    }

    /// Deliver a failed handshake to the listener's next `accept`
    pub fn fail_handshake(&self, peer: SocketAddr) {
        let _ = self.listener_tx.send(Err(TransportError::Handshake {
            peer,
            reason: "handshake aborted".to_string(),
        }));
    }
}

#[async_trait]
impl TransportListener for MockListener {
    type Connection = MockConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::EndpointClosed),
            conn = incoming.recv() => {
                let conn = conn.ok_or(TransportError::EndpointClosed)??;
                let remote = conn.remote_address();
                Ok((conn, remote))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _addr: SocketAddr,
        _server_name: &str,
    ) -> TransportResult<Self::Connection> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (client, server) = MockConnection::pair();
        client.fail_opens(self.fail_stream_opens.load(Ordering::SeqCst));
        self.listener_tx
            .send(Ok(server))
            .map_err(|_| TransportError::Connect("listener gone".to_string()))?;
        Ok(client)
    }
}
