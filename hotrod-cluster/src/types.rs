//! Shared value types for routing and remote operations

use crate::error::{ClientError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Network address of a cluster node as advertised in topology updates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ClientError::Config(format!("Invalid address '{}': missing port", addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ClientError::Config(format!("Invalid address '{}': {}", addr, e)))?;
        if host.is_empty() {
            return Err(ClientError::Config(format!(
                "Invalid address '{}': empty host",
                addr
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Behavioral modifiers sent with every request header
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const FORCE_RETURN_VALUE: Flags = Flags(0x0001);
    pub const DEFAULT_LIFESPAN: Flags = Flags(0x0002);
    pub const DEFAULT_MAXIDLE: Flags = Flags(0x0004);
    pub const SKIP_CACHE_LOAD: Flags = Flags(0x0008);
    pub const SKIP_INDEXING: Flags = Flags(0x0010);
    pub const SKIP_LISTENER_NOTIFICATION: Flags = Flags(0x0020);

    const NAMES: [(Flags, &'static str); 6] = [
        (Flags::FORCE_RETURN_VALUE, "FORCE_RETURN_VALUE"),
        (Flags::DEFAULT_LIFESPAN, "DEFAULT_LIFESPAN"),
        (Flags::DEFAULT_MAXIDLE, "DEFAULT_MAXIDLE"),
        (Flags::SKIP_CACHE_LOAD, "SKIP_CACHE_LOAD"),
        (Flags::SKIP_INDEXING, "SKIP_INDEXING"),
        (Flags::SKIP_LISTENER_NOTIFICATION, "SKIP_LISTENER_NOTIFICATION"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#x}: {})", self.0, names.join(" | "))
    }
}

/// How much cluster knowledge the client asks the server to send back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientIntelligence {
    /// No topology information
    Basic,
    /// Server list only
    TopologyAware,
    /// Server list plus per-segment owners
    HashDistributionAware,
}

impl Default for ClientIntelligence {
    fn default() -> Self {
        ClientIntelligence::HashDistributionAware
    }
}

impl ClientIntelligence {
    pub fn code(self) -> u8 {
        match self {
            ClientIntelligence::Basic => 0x01,
            ClientIntelligence::TopologyAware => 0x02,
            ClientIntelligence::HashDistributionAware => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ClientIntelligence::Basic),
            0x02 => Some(ClientIntelligence::TopologyAware),
            0x03 => Some(ClientIntelligence::HashDistributionAware),
            _ => None,
        }
    }
}

/// A lifespan or max-idle setting for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// Use the cache's configured default
    #[default]
    ServerDefault,
    /// Never expire
    Immortal,
    /// Expire after the given duration
    After(Duration),
}

impl Lifetime {
    /// Time unit code and value as encoded on the wire
    pub(crate) fn wire_parts(self) -> (u8, Option<u64>) {
        match self {
            Lifetime::ServerDefault => (0x07, None),
            Lifetime::Immortal => (0x08, None),
            Lifetime::After(d) if d.subsec_nanos() == 0 => (0x00, Some(d.as_secs())),
            Lifetime::After(d) if d.subsec_nanos() % 1_000_000 == 0 => {
                (0x01, Some(d.as_millis() as u64))
            }
            Lifetime::After(d) => (0x02, Some(d.as_nanos() as u64)),
        }
    }
}

/// Expiration settings for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration {
    pub lifespan: Lifetime,
    pub max_idle: Lifetime,
}

impl Expiration {
    pub fn new(lifespan: Lifetime, max_idle: Lifetime) -> Self {
        Self { lifespan, max_idle }
    }

    pub fn lifespan(lifespan: Duration) -> Self {
        Self {
            lifespan: Lifetime::After(lifespan),
            max_idle: Lifetime::ServerDefault,
        }
    }

    /// Flags implied by leaving either setting at the server default
    pub fn implied_flags(&self) -> Flags {
        let mut flags = Flags::NONE;
        if self.lifespan == Lifetime::ServerDefault {
            flags |= Flags::DEFAULT_LIFESPAN;
        }
        if self.max_idle == Lifetime::ServerDefault {
            flags |= Flags::DEFAULT_MAXIDLE;
        }
        flags
    }
}

/// A value together with its server-assigned version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: u64,
}

/// A value with its full expiration metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    /// Creation time (ms since epoch), absent for immortal entries
    pub created: Option<i64>,
    /// Lifespan in seconds, absent for immortal entries
    pub lifespan: Option<u32>,
    /// Last access time (ms since epoch), absent when max-idle is infinite
    pub last_used: Option<i64>,
    /// Max idle in seconds, absent when infinite
    pub max_idle: Option<u32>,
    pub version: u64,
    pub value: Bytes,
}

impl MetadataValue {
    pub(crate) fn from_parts(metadata: EntryMetadata, value: Bytes) -> Self {
        Self {
            created: metadata.created,
            lifespan: metadata.lifespan,
            last_used: metadata.last_used,
            max_idle: metadata.max_idle,
            version: metadata.version,
            value,
        }
    }
}

/// Expiration and version metadata of an entry, without its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    pub created: Option<i64>,
    pub lifespan: Option<u32>,
    pub last_used: Option<i64>,
    pub max_idle: Option<u32>,
    pub version: u64,
}

/// Result of an unconditional-by-key write that may or may not execute
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteResult {
    pub executed: bool,
    pub previous: Option<Bytes>,
}

/// Outcome of a version-conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedStatus {
    Success,
    /// The entry exists with a different version
    ModifiedKey,
    NoSuchKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedOperationResult {
    pub status: VersionedStatus,
    pub previous: Option<Bytes>,
}

/// Transaction identifier for XA prepare requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Bytes,
    pub branch_qualifier: Bytes,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Bytes>,
        branch_qualifier: impl Into<Bytes>,
    ) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// A null transaction id carries no global id
    pub fn is_null(&self) -> bool {
        self.global_transaction_id.is_empty()
    }
}

/// A single write recorded in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub key: Bytes,
    /// `None` removes the key
    pub value: Option<Bytes>,
    /// Version observed when the key was read, `None` if never read
    pub version_read: Option<u64>,
    /// Whether the key was read and found absent
    pub read_absent: bool,
    pub expiration: Expiration,
}

/// Server answer to a ping
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PingResponse {
    /// Highest protocol version the server speaks, when advertised
    pub server_version: Option<u8>,
    /// Request opcodes the server supports, when advertised
    pub supported_ops: Vec<u16>,
}

/// Cache statistics as reported by a server
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatistics {
    pub stats: HashMap<String, String>,
}

impl ServerStatistics {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.stats.get(name).map(String::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
}

/// Snapshot of a cache's segment distribution for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopologyInfo {
    pub topology_id: i32,
    pub num_segments: Option<u32>,
    pub segments_per_server: HashMap<NodeAddress, BTreeSet<u32>>,
}

/// A registered client listener and the node hosting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRegistration {
    pub listener_id: Bytes,
    pub address: NodeAddress,
}

/// Result of one SASL exchange step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub complete: bool,
    pub challenge: Bytes,
}
