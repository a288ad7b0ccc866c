//! End-to-end tests: proxy and bridge over real QUIC on loopback

use backhaul_transport_quic::{QuicConfig, QuicListener, QuicConnection};
use backhaul_tunnel::{
    BridgeAgent, BridgeConfig, BridgeError, Proxy, ProxyConfig, SessionManager, SessionState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul_tunnel=debug")
        .with_test_writer()
        .try_init();
}

struct RunningProxy {
    session_addr: SocketAddr,
    client_addr: SocketAddr,
    sessions: Arc<SessionManager<QuicConnection>>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), backhaul_tunnel::ProxyError>>,
}

async fn start_proxy(liveness_timeout: Duration) -> RunningProxy {
    init_tracing();

    let config = ProxyConfig::default()
        .with_session_addr("127.0.0.1:0".parse().unwrap())
        .with_client_addr("127.0.0.1:0".parse().unwrap())
        .with_watchdog_interval(Duration::from_millis(50))
        .with_liveness_timeout(liveness_timeout);
    let quic = Arc::new(QuicConfig::proxy_self_signed().unwrap());

    let proxy: Proxy<QuicListener> = Proxy::bind(config, quic).await.unwrap();
    let session_addr = proxy.session_addr().unwrap();
    let client_addr = proxy.client_addr().unwrap();
    let sessions = proxy.sessions();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(proxy.run(shutdown.clone()));

    RunningProxy {
        session_addr,
        client_addr,
        sessions,
        shutdown,
        task,
    }
}

fn bridge_config(proxy: &RunningProxy, target: &str) -> BridgeConfig {
    BridgeConfig::new(proxy.session_addr.to_string(), target)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_dial_timeout(Duration::from_secs(1))
}

async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

async fn wait_for_session(proxy: &RunningProxy, previous: Option<u64>) -> u64 {
    for _ in 0..200 {
        if let Some(session) = proxy.sessions.current().await {
            if Some(session.id()) != previous && session.heartbeat_stream_id().is_some() {
                return session.id();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge session never became active");
}

async fn echo_through(client_addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(client_addr).await.unwrap();
    client.write_all(payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    echoed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_reaches_target_through_tunnel() {
    let proxy = start_proxy(Duration::from_secs(10)).await;
    let target = echo_target().await;

    let bridge = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let bridge_shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn(bridge.run(bridge_shutdown.clone()));
    wait_for_session(&proxy, None).await;

    assert_eq!(echo_through(proxy.client_addr, b"hello").await, b"hello");

    // Several concurrent clients each get their own stream
    let mut clients = Vec::new();
    for i in 0..5u8 {
        let client_addr = proxy.client_addr;
        clients.push(tokio::spawn(async move {
            let payload = vec![i; 32 * 1024];
            let echoed = echo_through(client_addr, &payload).await;
            assert_eq!(echoed, payload);
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    bridge_shutdown.cancel();
    assert!(bridge_task.await.unwrap().is_ok());
    proxy.shutdown.cancel();
    assert!(proxy.task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_bridge_is_replaced_after_restart() {
    let proxy = start_proxy(Duration::from_millis(500)).await;
    let target = echo_target().await;

    // A bridge that connects but never sends probes, as if it hung
    let stale = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let stale_id = wait_for_session(&proxy, None).await;

    for _ in 0..100 {
        if proxy.sessions.current().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        proxy.sessions.current().await.is_none(),
        "stale session should be torn down after the liveness timeout"
    );
    drop(stale);

    // The restarted bridge is served again
    let bridge = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let bridge_shutdown = CancellationToken::new();
    tokio::spawn(bridge.run(bridge_shutdown.clone()));
    let new_id = wait_for_session(&proxy, Some(stale_id)).await;
    assert_ne!(new_id, stale_id);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(proxy.sessions.current().await.unwrap().id(), new_id);
    assert_eq!(echo_through(proxy.client_addr, b"again").await, b"again");

    bridge_shutdown.cancel();
    proxy.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_bridge_supersedes_running_one() {
    let proxy = start_proxy(Duration::from_secs(10)).await;
    let target = echo_target().await;

    let first = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let first_task = tokio::spawn(first.run(CancellationToken::new()));
    let first_id = wait_for_session(&proxy, None).await;

    let second = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let second_shutdown = CancellationToken::new();
    tokio::spawn(second.run(second_shutdown.clone()));
    wait_for_session(&proxy, Some(first_id)).await;

    let first_result = timeout(Duration::from_secs(5), first_task)
        .await
        .expect("superseded bridge should stop")
        .unwrap();
    assert!(matches!(first_result, Err(BridgeError::SessionClosed)));

    assert_eq!(echo_through(proxy.client_addr, b"second").await, b"second");

    second_shutdown.cancel();
    proxy.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_closes_in_flight_clients() {
    let proxy = start_proxy(Duration::from_secs(10)).await;
    let target = echo_target().await;

    let bridge = BridgeAgent::connect(bridge_config(&proxy, &target.to_string()))
        .await
        .unwrap();
    let bridge_task = tokio::spawn(bridge.run(CancellationToken::new()));
    wait_for_session(&proxy, None).await;

    let mut client = TcpStream::connect(proxy.client_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    // The client is mid-connection when its session goes away
    let session = proxy.sessions.current().await.unwrap();
    assert!(
        proxy
            .sessions
            .teardown_if_current(&session, SessionState::TimedOut)
            .await
    );

    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("client should be closed together with its session");
    assert!(rest.is_empty());
    assert!(proxy.sessions.current().await.is_none());

    let bridge_result = timeout(Duration::from_secs(5), bridge_task)
        .await
        .expect("bridge should notice the closed session")
        .unwrap();
    assert!(bridge_result.is_err());

    proxy.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_target_closes_client_with_no_bytes() {
    let proxy = start_proxy(Duration::from_secs(10)).await;
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let bridge = BridgeAgent::connect(bridge_config(&proxy, &closed_port.to_string()))
        .await
        .unwrap();
    let bridge_shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn(bridge.run(bridge_shutdown.clone()));
    let session_id = wait_for_session(&proxy, None).await;

    let mut client = TcpStream::connect(proxy.client_addr).await.unwrap();
    let mut received = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("client should be closed promptly");
    assert!(received.is_empty());

    // Only the stream failed; the session carries on
    assert_eq!(proxy.sessions.current().await.unwrap().id(), session_id);
    assert!(!bridge_task.is_finished());

    bridge_shutdown.cancel();
    proxy.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_closed_when_no_bridge_connected() {
    let proxy = start_proxy(Duration::from_secs(10)).await;

    let mut client = TcpStream::connect(proxy.client_addr).await.unwrap();
    let mut received = Vec::new();
    let _ = timeout(Duration::from_secs(2), client.read_to_end(&mut received))
        .await
        .expect("client should not be left pending");
    assert!(received.is_empty());

    proxy.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bridge_fails_fast_without_proxy() {
    init_tracing();

    // Nothing listens on this UDP port
    let unused = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let config = BridgeConfig::new(unused.to_string(), "127.0.0.1:9")
        .with_connect_timeout(Duration::from_millis(500));

    let err = BridgeAgent::connect(config).await.err().unwrap();
    assert_eq!(err.exit_code(), 2);
}
