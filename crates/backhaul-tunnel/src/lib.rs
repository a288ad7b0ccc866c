//! Reverse tunnel engine
//!
//! A [`Proxy`] on a public host accepts one encrypted session from a
//! [`BridgeAgent`] running next to a private service. Each TCP client of the
//! proxy is carried over its own stream of that session and relayed by the
//! bridge to the target, byte for byte.
//!
//! ```text
//! client ──tcp──> Proxy ══ QUIC session ══> BridgeAgent ──tcp──> target
//!                   ^        heartbeat probes     │
//!                   └─────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod failure;
pub mod heartbeat;
pub mod protocol;
pub mod proxy;
pub mod pump;
pub mod session;

pub use bridge::BridgeAgent;
pub use config::{BridgeConfig, ProxyConfig};
pub use error::{BridgeError, ConfigError, ProxyError, PumpError, StreamTagError};
pub use failure::FailureCounter;
pub use heartbeat::HeartbeatSender;
pub use protocol::{StreamRole, PROBE};
pub use proxy::Proxy;
pub use pump::{Direction, DuplexPump, PumpReport};
pub use session::{ActiveSession, LivenessState, SessionManager, SessionState};
