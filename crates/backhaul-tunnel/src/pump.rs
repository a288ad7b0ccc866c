//! Bidirectional byte pump between two duplex endpoints
//!
//! Used on both ends of a tunnel: client TCP <-> tunnel stream on the proxy,
//! tunnel stream <-> target TCP on the bridge. Bytes pass through unmodified.

use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::PumpError;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on shutting down a write side once the pump is over
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Copy direction relative to the endpoints passed to [`DuplexPump::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First endpoint to second
    Forward,
    /// Second endpoint to first
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// What happened during one pump run
#[derive(Debug)]
pub struct PumpReport {
    /// Direction whose completion ended the pump
    pub first_finished: Direction,
    /// Bytes written to the second endpoint
    pub forward_bytes: u64,
    /// Bytes written to the first endpoint
    pub reverse_bytes: u64,
    /// Error that ended the first direction, if it did not end on EOF
    pub error: Option<PumpError>,
}

impl PumpReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Copies bytes both ways until either side finishes, then closes both
#[derive(Debug, Clone)]
pub struct DuplexPump {
    forward_label: &'static str,
    reverse_label: &'static str,
}

impl DuplexPump {
    /// Labels name each direction in logs, e.g. "client->tunnel"
    pub fn new(forward_label: &'static str, reverse_label: &'static str) -> Self {
        Self {
            forward_label,
            reverse_label,
        }
    }

    pub async fn run<A, B>(&self, a: A, b: B) -> PumpReport
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        let mut forward_bytes = 0u64;
        let mut reverse_bytes = 0u64;

        let (first_finished, result) = tokio::select! {
            result = copy_counted(&mut a_read, &mut b_write, &mut forward_bytes) => {
                (Direction::Forward, result)
            }
            result = copy_counted(&mut b_read, &mut a_write, &mut reverse_bytes) => {
                (Direction::Reverse, result)
            }
        };

        // Either side finishing closes both
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, b_write.shutdown()).await;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, a_write.shutdown()).await;

        let error = result.err().map(|source| PumpError::Copy {
            direction: first_finished,
            bytes: match first_finished {
                Direction::Forward => forward_bytes,
                Direction::Reverse => reverse_bytes,
            },
            source,
        });

        let label = match first_finished {
            Direction::Forward => self.forward_label,
            Direction::Reverse => self.reverse_label,
        };
        match &error {
            Some(e) => debug!(
                direction = label,
                forward_bytes,
                reverse_bytes,
                error = %e,
                "Pump ended with error"
            ),
            None => debug!(
                direction = label,
                forward_bytes,
                reverse_bytes,
                "Pump ended on EOF"
            ),
        }

        PumpReport {
            first_finished,
            forward_bytes,
            reverse_bytes,
            error,
        }
    }
}

// Not tokio::io::copy: the count must survive when select! drops the losing direction
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
