//! Client configuration

use crate::codec::ProtocolVersion;
use crate::error::Result;
use crate::types::{ClientIntelligence, NodeAddress};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Initial server list (`host:port`), used until the first topology arrives
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Protocol version to speak
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Amount of topology information requested from servers
    #[serde(default)]
    pub client_intelligence: ClientIntelligence,

    /// Always ask the server for previous values on writes
    #[serde(default)]
    pub force_return_values: bool,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds (covers all retries of one call)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Upper bound on attempts per call; the cluster size + 1 also bounds it
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// How long to wait for the late response of an abandoned request
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Entries per page for server-side scans
    #[serde(default = "default_batch_size")]
    pub iteration_batch_size: u32,

    /// Chunk size for streamed writes
    #[serde(default = "default_chunk_size")]
    pub stream_chunk_size: usize,
}

fn default_servers() -> Vec<String> {
    vec!["127.0.0.1:11222".to_string()]
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    60000
}

fn default_max_retries() -> usize {
    10
}

fn default_drain_timeout() -> u64 {
    5000
}

fn default_batch_size() -> u32 {
    10000
}

fn default_chunk_size() -> usize {
    8192
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            protocol_version: ProtocolVersion::default(),
            client_intelligence: ClientIntelligence::default(),
            force_return_values: false,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            drain_timeout_ms: default_drain_timeout(),
            iteration_batch_size: default_batch_size(),
            stream_chunk_size: default_chunk_size(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from TOML
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse the configured server list
    pub fn initial_servers(&self) -> Result<Vec<NodeAddress>> {
        self.servers.iter().map(|s| NodeAddress::parse(s)).collect()
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
