//! Heartbeat channel
//!
//! The bridge writes one probe byte per interval on its heartbeat stream. The
//! proxy refreshes the session's liveness on every probe it reads, and a
//! watchdog tears the session down once probes stop arriving.

use backhaul_transport::TransportConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::failure::FailureCounter;
use crate::protocol::PROBE;
use crate::session::{ActiveSession, SessionManager, SessionState};

/// Bridge side: writes probes until writes keep failing
#[derive(Debug)]
pub struct HeartbeatSender<S> {
    stream: S,
    interval: Duration,
    max_failures: u32,
    failures: FailureCounter,
}

impl<S> HeartbeatSender<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: S, interval: Duration, max_failures: u32) -> Self {
        Self {
            stream,
            interval,
            max_failures,
            failures: FailureCounter::new(),
        }
    }

    /// Send probes forever; returns once failures exceed the threshold
    pub async fn run(mut self) -> BridgeError {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let write = tokio::time::timeout(self.interval, self.send_probe()).await;
            let error = match write {
                Ok(Ok(())) => {
                    self.failures.reset();
                    trace!("Heartbeat probe sent");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("write timed out after {:?}", self.interval),
            };

            let failures = self.failures.record();
            warn!(failures, error = %error, "Heartbeat write failed");
            if failures > self.max_failures {
                return BridgeError::ExcessiveHeartbeatFailures { failures };
            }
        }
    }

    async fn send_probe(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&[PROBE]).await?;
        self.stream.flush().await
    }
}

/// Proxy side: read probes from the heartbeat stream into the session's liveness
///
/// Read errors and EOF are retried after `retry_delay`; only the watchdog
/// ends a session. Returns once the session is closed.
pub async fn receive_heartbeats<C, S>(
    session: Arc<ActiveSession<C>>,
    mut stream: S,
    retry_delay: Duration,
) where
    C: TransportConnection,
    S: AsyncRead + Unpin,
{
    let mut probe = [0u8; 1];

    while !session.is_closed() {
        match stream.read(&mut probe).await {
            Ok(0) => {
                debug!(session_id = session.id(), "Heartbeat stream ended");
                tokio::time::sleep(retry_delay).await;
            }
            Ok(_) if probe[0] == PROBE => {
                session.liveness().touch();
                trace!(session_id = session.id(), "Heartbeat probe received");
            }
            Ok(_) => {
                trace!(
                    session_id = session.id(),
                    byte = probe[0],
                    "Ignoring non-probe byte on heartbeat stream"
                );
            }
            Err(e) => {
                warn!(
                    session_id = session.id(),
                    error = %e,
                    "Heartbeat read failed"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    debug!(session_id = session.id(), "Heartbeat receiver stopped");
}

/// Tear down the active session once its probes have been silent too long
pub async fn run_watchdog<C>(
    sessions: Arc<SessionManager<C>>,
    interval: Duration,
    liveness_timeout: Duration,
) where
    C: TransportConnection,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(session) = sessions.current().await else {
            continue;
        };

        let silence = session.liveness().silence();
        if silence > liveness_timeout {
            warn!(
                session_id = session.id(),
                silence_ms = silence.as_millis() as u64,
                "No heartbeat within {:?}, closing session",
                liveness_timeout
            );
            sessions
                .teardown_if_current(&session, SessionState::TimedOut)
                .await;
        }
    }
}
