//! backhaul - reverse TCP tunnel over a single QUIC session
//!
//! Run as proxy on a public host (TUNPORT + TCPPORT) and as bridge next to
//! the private service (SERVER + TARGET).

use anyhow::{Context, Result};
use backhaul_transport_quic::{ensure_crypto_provider, QuicConfig};
use backhaul_tunnel::error::EXIT_CONFIG;
use backhaul_tunnel::{
    BridgeAgent, BridgeConfig, BridgeError, ConfigError, Proxy, ProxyConfig, ProxyError,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Delay before exiting on a fatal runtime error
const FATAL_EXIT_DELAY: Duration = Duration::from_secs(3);

/// Delay before exiting on a configuration error
const CONFIG_EXIT_DELAY: Duration = Duration::from_secs(10);

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("GIT_HASH"),
    "\nbuilt:  ",
    env!("BUILD_TIME"),
);

/// backhaul - expose a private TCP service through a public proxy
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(version, long_version = LONG_VERSION)]
#[command(long_about = r#"
Expose a TCP service that has no inbound reachability.

Proxy (public host):
  TUNPORT=4433 TCPPORT=2222 backhaul

Bridge (next to the service):
  SERVER=proxy.example.com:4433 TARGET=127.0.0.1:22 backhaul

Clients then connect to proxy.example.com:2222."#)]
struct Cli {
    /// Proxy: UDP port for the bridge session
    #[arg(long, env = "TUNPORT")]
    tun_port: Option<u16>,

    /// Proxy: TCP port for clients
    #[arg(long, env = "TCPPORT")]
    tcp_port: Option<u16>,

    /// Bridge: proxy session address (host:port)
    #[arg(long, env = "SERVER")]
    server: Option<String>,

    /// Bridge: target service address (host:port)
    #[arg(long, env = "TARGET")]
    target: Option<String>,

    /// Proxy: PEM certificate (self-signed when omitted)
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Proxy: PEM private key
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log filter, e.g. "info" or "backhaul_tunnel=debug"
    #[arg(long, env = "BACKHAUL_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Role {
    Proxy {
        tun_port: u16,
        tcp_port: u16,
        tls: Option<(PathBuf, PathBuf)>,
    },
    Bridge {
        server: String,
        target: String,
    },
}

impl Cli {
    /// Pick the role from which settings are present
    ///
    /// Port 0 and empty strings count as unset.
    fn role(&self) -> Result<Role, ConfigError> {
        let tun_port = self.tun_port.filter(|port| *port != 0);
        let tcp_port = self.tcp_port.filter(|port| *port != 0);
        let server = self.server.clone().filter(|s| !s.trim().is_empty());
        let target = self.target.clone().filter(|s| !s.trim().is_empty());

        let proxy_set = tun_port.is_some() || tcp_port.is_some();
        let bridge_set = server.is_some() || target.is_some();

        match (proxy_set, bridge_set) {
            (false, false) => Err(ConfigError::NoRole),
            (true, true) => Err(ConfigError::ConflictingRoles {
                proxy: "TUNPORT/TCPPORT".to_string(),
                bridge: "SERVER/TARGET".to_string(),
            }),
            (true, false) => match (tun_port, tcp_port) {
                (Some(tun_port), Some(tcp_port)) => Ok(Role::Proxy {
                    tun_port,
                    tcp_port,
                    tls: self.tls_cert.clone().zip(self.tls_key.clone()),
                }),
                (Some(_), None) => Err(ConfigError::Incomplete {
                    role: "proxy",
                    present: "TUNPORT",
                    missing: "TCPPORT",
                }),
                _ => Err(ConfigError::Incomplete {
                    role: "proxy",
                    present: "TCPPORT",
                    missing: "TUNPORT",
                }),
            },
            (false, true) => match (server, target) {
                (Some(server), Some(target)) => Ok(Role::Bridge { server, target }),
                (Some(_), None) => Err(ConfigError::Incomplete {
                    role: "bridge",
                    present: "SERVER",
                    missing: "TARGET",
                }),
                _ => Err(ConfigError::Incomplete {
                    role: "bridge",
                    present: "TARGET",
                    missing: "SERVER",
                }),
            },
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log filter '{}'", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}

/// Exit code for an error returned by `run`
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<ProxyError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<BridgeError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<ConfigError>() {
        e.exit_code()
    } else {
        EXIT_CONFIG
    }
}

async fn run_proxy(
    tun_port: u16,
    tcp_port: u16,
    tls: Option<(PathBuf, PathBuf)>,
    shutdown: CancellationToken,
) -> Result<()> {
    let quic = match &tls {
        Some((cert, key)) => {
            info!("Using certificate {}", cert.display());
            QuicConfig::proxy_from_pem(cert, key)
        }
        None => {
            info!("No TLS_CERT/TLS_KEY given, using an ephemeral self-signed certificate");
            QuicConfig::proxy_self_signed()
        }
    }
    .map_err(|e| ProxyError::SessionListener {
        address: "0.0.0.0".to_string(),
        port: tun_port,
        reason: e.to_string(),
    })?;

    let proxy = Proxy::bind(ProxyConfig::new(tun_port, tcp_port), Arc::new(quic)).await?;
    proxy.run(shutdown).await?;
    Ok(())
}

async fn run_bridge(server: String, target: String, shutdown: CancellationToken) -> Result<()> {
    warn!("Server certificate verification is disabled for the proxy session");

    let bridge = BridgeAgent::connect(BridgeConfig::new(server, target)).await?;
    bridge.run(shutdown).await?;
    Ok(())
}

async fn run(role: Role) -> Result<()> {
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            on_signal.cancel();
        }
    });

    match role {
        Role::Proxy {
            tun_port,
            tcp_port,
            tls,
        } => {
            info!(tun_port, tcp_port, "Starting proxy");
            run_proxy(tun_port, tcp_port, tls, shutdown).await
        }
        Role::Bridge { server, target } => {
            info!(server = %server, target = %target, "Starting bridge");
            run_bridge(server, target, shutdown).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            tokio::time::sleep(CONFIG_EXIT_DELAY).await;
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{:#}", e);
    }

    ensure_crypto_provider();

    let role = match cli.role() {
        Ok(role) => role,
        Err(e) => {
            error!("{}", e);
            tokio::time::sleep(CONFIG_EXIT_DELAY).await;
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = run(role).await {
        let code = exit_code(&e);
        error!("{:#}", e);
        error!("Exiting with code {} in {:?}", code, FATAL_EXIT_DELAY);
        tokio::time::sleep(FATAL_EXIT_DELAY).await;
        std::process::exit(code);
    }

    info!("backhaul stopped");
}
