//! Proxy and bridge configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// UDP address for inbound bridge sessions
    pub session_addr: SocketAddr,

    /// TCP address for clients
    pub client_addr: SocketAddr,

    /// Silence on the heartbeat stream longer than this tears the session down
    pub liveness_timeout: Duration,

    /// How often the watchdog checks liveness
    pub watchdog_interval: Duration,

    /// Delay before retrying a failed heartbeat read
    pub heartbeat_retry_delay: Duration,

    /// Deadline for opening a tunnel stream and sending its tag
    pub stream_open_timeout: Duration,

    /// Consecutive open failures tolerated before the proxy gives up
    pub max_stream_open_failures: u32,

    /// Backoff after a failed TCP accept
    pub accept_error_backoff: Duration,

    /// Deadline for a peer-opened stream to deliver its role tag
    pub tag_read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            session_addr: (Ipv4Addr::UNSPECIFIED, 0).into(),
            client_addr: (Ipv4Addr::UNSPECIFIED, 0).into(),
            liveness_timeout: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(1),
            heartbeat_retry_delay: Duration::from_secs(1),
            stream_open_timeout: Duration::from_secs(3),
            max_stream_open_failures: 3,
            accept_error_backoff: Duration::from_secs(3),
            tag_read_timeout: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Listen on all interfaces with the given session (UDP) and client (TCP) ports
    pub fn new(session_port: u16, client_port: u16) -> Self {
        Self {
            session_addr: (Ipv4Addr::UNSPECIFIED, session_port).into(),
            client_addr: (Ipv4Addr::UNSPECIFIED, client_port).into(),
            ..Default::default()
        }
    }

    pub fn with_session_addr(mut self, addr: SocketAddr) -> Self {
        self.session_addr = addr;
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = addr;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.stream_open_timeout = timeout;
        self
    }

    pub fn with_max_stream_open_failures(mut self, max: u32) -> Self {
        self.max_stream_open_failures = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "watchdog_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.liveness_timeout <= self.watchdog_interval {
            return Err(ConfigError::Invalid {
                name: "liveness_timeout",
                reason: format!(
                    "{:?} must be longer than the watchdog interval {:?}",
                    self.liveness_timeout, self.watchdog_interval
                ),
            });
        }
        if self.stream_open_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "stream_open_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Proxy session address, `host:port`
    pub server_addr: String,

    /// Local target address, `host:port`
    pub target_addr: String,

    /// Deadline for establishing the session
    pub connect_timeout: Duration,

    /// Deadline for opening the heartbeat stream
    pub heartbeat_open_timeout: Duration,

    /// Interval between probes
    pub heartbeat_interval: Duration,

    /// Consecutive probe write failures tolerated before giving up
    pub max_heartbeat_failures: u32,

    /// Deadline for dialing the target
    pub dial_timeout: Duration,

    /// Delay before retrying a failed stream accept
    pub accept_retry_delay: Duration,

    /// Deadline for a proxy-opened stream to deliver its role tag
    pub tag_read_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            target_addr: String::new(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_open_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            max_heartbeat_failures: 5,
            dial_timeout: Duration::from_secs(5),
            accept_retry_delay: Duration::from_secs(1),
            tag_read_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    pub fn new(server_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            target_addr: target_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_heartbeat_failures(mut self, max: u32) -> Self {
        self.max_heartbeat_failures = max;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_host_port("SERVER", &self.server_addr)?;
        check_host_port("TARGET", &self.target_addr)?;
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "heartbeat_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Host part of the server address, used as the TLS server name
    pub fn server_name(&self) -> String {
        let host = self
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server_addr)
            .trim_start_matches('[')
            .trim_end_matches(']');

        if host.is_empty() {
            "localhost".to_string()
        } else {
            host.to_string()
        }
    }
}

fn check_host_port(name: &'static str, addr: &str) -> Result<(), ConfigError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| ConfigError::Invalid {
        name,
        reason: format!("'{}' is not in host:port form", addr),
    })?;

    if host.is_empty() {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("'{}' has no host", addr),
        });
    }

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid {
            name,
            reason: format!("'{}' has no valid port", addr),
        }),
        Ok(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_defaults() {
        let config = ProxyConfig::new(4433, 8080);
        assert_eq!(config.session_addr.port(), 4433);
        assert_eq!(config.client_addr.port(), 8080);
        assert_eq!(config.liveness_timeout, Duration::from_secs(10));
        assert_eq!(config.watchdog_interval, Duration::from_secs(1));
        assert_eq!(config.stream_open_timeout, Duration::from_secs(3));
        assert_eq!(config.max_stream_open_failures, 3);
        assert_eq!(config.accept_error_backoff, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_rejects_liveness_shorter_than_watchdog() {
        let config = ProxyConfig::default()
            .with_watchdog_interval(Duration::from_secs(2))
            .with_liveness_timeout(Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                name: "liveness_timeout",
                ..
            })
        ));
    }

    #[test]
    fn test_bridge_defaults() {
        let config = BridgeConfig::new("proxy.example.com:4433", "127.0.0.1:22");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_heartbeat_failures, 5);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bridge_rejects_malformed_addresses() {
        assert!(BridgeConfig::new("proxy", "127.0.0.1:22").validate().is_err());
        assert!(BridgeConfig::new("proxy:4433", ":22").validate().is_err());
        assert!(BridgeConfig::new("proxy:0", "127.0.0.1:22").validate().is_err());
        assert!(BridgeConfig::new("proxy:4433", "127.0.0.1:http")
            .validate()
            .is_err());
    }

    #[test]
    fn test_server_name_from_address() {
        assert_eq!(
            BridgeConfig::new("proxy.example.com:4433", "t:1").server_name(),
            "proxy.example.com"
        );
        assert_eq!(
            BridgeConfig::new("127.0.0.1:4433", "t:1").server_name(),
            "127.0.0.1"
        );
        assert_eq!(BridgeConfig::new("[::1]:4433", "t:1").server_name(), "::1");
    }
}
