//! Construction-time configuration for the lookup client.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chainloc_common::{ChainlocError, ChainlocResult};
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;

/// One lookup-service node address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Resolves to a socket address. Every reconnect resolves afresh so a
    /// node that moved behind its name is picked up.
    pub async fn resolve(&self) -> ChainlocResult<SocketAddr> {
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| ChainlocError::InvalidAddress(self.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for the client and its two pools.
///
/// SET connections outnumber GET connections by default: SET round-trip
/// latency is the bottleneck under heavy write load, and only extra sockets
/// buy parallelism there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Lookup-service nodes, assigned to connections round-robin.
    pub endpoints: Vec<Endpoint>,
    /// Connections in the GET pool.
    #[serde(default = "default_get_connections")]
    pub get_connections: usize,
    /// Connections in the SET pool.
    #[serde(default = "default_set_connections")]
    pub set_connections: usize,
    /// Per-query deadline applied to GETs. SETs have none.
    #[serde(default = "default_get_timeout")]
    pub get_timeout: Option<Duration>,
    /// Requeue attempts before a query is dead-lettered as a failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_get_connections() -> usize {
    4
}

fn default_set_connections() -> usize {
    16
}

fn default_get_timeout() -> Option<Duration> {
    Some(Duration::from_millis(500))
}

fn default_max_retries() -> u32 {
    8
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoints: Vec::new(),
            get_connections: default_get_connections(),
            set_connections: default_set_connections(),
            get_timeout: default_get_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl ClientConfig {
    /// Validates that the configuration can actually drive a pool.
    pub fn validate(&self) -> ChainlocResult<()> {
        if self.endpoints.is_empty() {
            return Err(ChainlocError::InvalidAddress(
                "no lookup endpoints configured".to_string(),
            ));
        }
        if self.get_connections == 0 || self.set_connections == 0 {
            return Err(ChainlocError::InvalidAddress(
                "pool sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
