//! Error types for the tunnel engine
//!
//! Leaf components never terminate the process themselves. Anything fatal is
//! returned up to the binary, which maps it to a process exit code.

use std::time::Duration;
use thiserror::Error;

use crate::pump::Direction;

/// Exit code for configuration errors
pub const EXIT_CONFIG: i32 = 1;
/// Exit code when the bridge cannot establish its session
pub const EXIT_SESSION_DIAL: i32 = 2;
/// Exit code when the bridge cannot open its heartbeat stream
pub const EXIT_HEARTBEAT_OPEN: i32 = 3;
/// Exit code after too many consecutive heartbeat write failures
pub const EXIT_HEARTBEAT_WRITE: i32 = 4;
/// Exit code after too many consecutive tunnel stream open failures
pub const EXIT_STREAM_OPEN: i32 = 5;
/// Exit code when a proxy listener cannot be started
pub const EXIT_LISTENER: i32 = 6;
/// Exit code when the session closes underneath the bridge
pub const EXIT_SESSION_CLOSED: i32 = 7;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No role configured.\n\nSet TUNPORT and TCPPORT to run as proxy, or SERVER and TARGET to run as bridge.")]
    NoRole,

    #[error("Both proxy ({proxy}) and bridge ({bridge}) settings are present.\n\nSet only TUNPORT and TCPPORT (proxy) or only SERVER and TARGET (bridge).")]
    ConflictingRoles { proxy: String, bridge: String },

    #[error("{present} is set but {missing} is not.\n\nThe {role} role needs both {present} and {missing}.")]
    Incomplete {
        role: &'static str,
        present: &'static str,
        missing: &'static str,
    },

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        EXIT_CONFIG
    }
}

/// Fatal proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid proxy configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start session listener on {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using UDP port {port}\n  • Check the TLS certificate and key paths")]
    SessionListener {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to bind client listener on {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different port")]
    ClientListener {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Session listener on {address} stopped accepting")]
    SessionListenerClosed { address: String },

    #[error("Opening tunnel streams failed {failures} times in a row, the session is unusable")]
    ExcessiveStreamOpenFailures { failures: u32 },
}

impl ProxyError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::Config(e) => e.exit_code(),
            ProxyError::SessionListener { .. }
            | ProxyError::SessionListenerClosed { .. }
            | ProxyError::ClientListener { .. } => EXIT_LISTENER,
            ProxyError::ExcessiveStreamOpenFailures { .. } => EXIT_STREAM_OPEN,
        }
    }
}

/// Fatal bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid bridge configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to proxy at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Timed out after {timeout:?} connecting to proxy at {address}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Failed to open heartbeat stream: {reason}")]
    HeartbeatOpen { reason: String },

    #[error("Heartbeat writes failed {failures} times in a row")]
    ExcessiveHeartbeatFailures { failures: u32 },

    #[error("Session closed by the proxy or the network")]
    SessionClosed,
}

impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(e) => e.exit_code(),
            BridgeError::Connect { .. } | BridgeError::ConnectTimeout { .. } => EXIT_SESSION_DIAL,
            BridgeError::HeartbeatOpen { .. } => EXIT_HEARTBEAT_OPEN,
            BridgeError::ExcessiveHeartbeatFailures { .. } => EXIT_HEARTBEAT_WRITE,
            BridgeError::SessionClosed => EXIT_SESSION_CLOSED,
        }
    }
}

/// Error that ended one direction of a duplex pump
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("{direction} copy failed after {bytes} bytes: {source}")]
    Copy {
        direction: Direction,
        bytes: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reading the role tag at the start of a stream
#[derive(Debug, Error)]
pub enum StreamTagError {
    #[error("Stream ended before its role tag")]
    Eof,

    #[error("Unknown stream role tag 0x{0:02x}")]
    Unknown(u8),

    #[error("IO error reading role tag: {0}")]
    Io(#[from] std::io::Error),
}
