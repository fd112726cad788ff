// Server and endpoint configuration

use crate::error::{Error, Result};
use crate::peer::types::{IceServerConfig, MediaConstraints};
use crate::utils::add_ice_url_scheme;
use clap::Parser;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

// Verbose logs in debug builds, lifecycle only in release
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peercall_lib=debug,peercall=debug,info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001";

/// Time a disconnected transport gets to recover before the call fails
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Time a call may spend in setup before the transport must be up
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    vec![
        IceServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        IceServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

/// Signaling server command line
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "WebRTC signaling server", long_about = None)]
pub struct ServerArgs {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0", env = "PEERCALL_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PORT")]
    pub port: u16,

    /// Browser origins allowed to open a signaling socket (comma-separated).
    /// Clients that send no Origin header are always accepted.
    #[arg(
        long = "allowed-origin",
        value_delimiter = ',',
        default_value = "http://localhost:3000",
        env = "PEERCALL_ALLOWED_ORIGINS"
    )]
    pub allowed_origins: Vec<String>,

    /// Log filter, overrides RUST_LOG
    #[arg(long, env = "PEERCALL_LOG")]
    pub log: Option<String>,
}

impl ServerArgs {
    /// Resolves `--host`, which may be a hostname or a bare IPv4/IPv6 address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Config(format!("bad bind address {host} port {}: {e}", self.port)))?
            .next()
            .ok_or_else(|| Error::Config(format!("{host} resolved to no address")))
    }
}

/// Runtime settings the server needs after startup
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind: Option<SocketAddr>,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        Ok(Self {
            bind: Some(args.bind_addr()?),
            allowed_origins: args
                .allowed_origins
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty() && o != "*")
                .collect(),
        })
    }

    /// Origin check for the websocket handshake
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed_origins.is_empty() => true,
            Some(origin) => {
                let origin = origin.trim_end_matches('/');
                self.allowed_origins.iter().any(|o| o == origin)
            }
        }
    }
}

/// Endpoint-side settings
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub grace_period_secs: u64,
    pub connect_timeout_secs: u64,
    pub media: MediaConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            grace_period_secs: GRACE_PERIOD.as_secs(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            media: MediaConstraints::default(),
        }
    }
}

impl ClientConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Rejects unusable ICE entries and normalizes URL schemes
    pub fn validate(mut self) -> Result<Self> {
        if self.signaling_url.is_empty() {
            return Err(Error::Config("signaling url cannot be empty".into()));
        }

        for server in &mut self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config(format!("ICE server {} has no url", server.id)));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }

            server.url = add_ice_url_scheme(server);
        }

        Ok(self)
    }
}
