//! Versioned topology tracking per cache
//!
//! Each cache has a [`TopologyCell`] holding an `Arc<ClientTopology>`.
//! Readers clone the `Arc` and work on an immutable snapshot; writers swap
//! in a whole new snapshot, and only when its epoch is strictly newer.
//!
//! ```text
//! response / push ─► TopologyUpdate ─► ClientTopology ─► update_if_newer
//!                                                          │
//!                        epoch <= current ◄── dropped ◄────┤
//!                        epoch  > current ──► swapped ◄────┘
//! ```

use crate::codec::{read_topology_update, TopologyUpdate, HASH_FUNCTION_MURMUR3};
use crate::consistent_hash::SegmentMap;
use crate::error::Result;
use crate::metrics;
use crate::types::{CacheTopologyInfo, ClientIntelligence, NodeAddress};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Epoch of a client that has not received any topology
pub const NO_TOPOLOGY: i32 = -1;

/// One immutable view of the cluster for a cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTopology {
    epoch: i32,
    intelligence: ClientIntelligence,
    servers: Vec<NodeAddress>,
    segment_map: Option<SegmentMap>,
}

impl ClientTopology {
    pub fn new(
        epoch: i32,
        intelligence: ClientIntelligence,
        servers: Vec<NodeAddress>,
        segment_map: Option<SegmentMap>,
    ) -> Self {
        Self {
            epoch,
            intelligence,
            servers,
            segment_map,
        }
    }

    /// Topology before any server answered: known seeds, no owners
    pub fn initial(intelligence: ClientIntelligence, servers: Vec<NodeAddress>) -> Self {
        Self::new(NO_TOPOLOGY, intelligence, servers, None)
    }

    /// Convert a decoded wire topology
    pub fn from_update(update: TopologyUpdate, intelligence: ClientIntelligence) -> Result<Self> {
        let segment_map = match update.segment_owners {
            Some(ref owners) if update.hash_function == HASH_FUNCTION_MURMUR3 => {
                Some(SegmentMap::from_indices(&update.servers, owners)?)
            }
            Some(_) => {
                warn!(
                    "Unsupported hash function version {} in topology {}, routing to any node",
                    update.hash_function, update.topology_id
                );
                None
            }
            None => None,
        };
        Ok(Self::new(
            update.topology_id,
            intelligence,
            update.servers,
            segment_map,
        ))
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    pub fn servers(&self) -> &[NodeAddress] {
        &self.servers
    }

    pub fn segment_map(&self) -> Option<&SegmentMap> {
        self.segment_map.as_ref()
    }

    pub fn cluster_size(&self) -> usize {
        self.servers.len()
    }

    /// Owners of `key`, empty when no segment data is known
    pub fn owners_of(&self, key: &[u8]) -> &[NodeAddress] {
        self.segment_map
            .as_ref()
            .map(|map| map.owners_of(key))
            .unwrap_or(&[])
    }

    pub fn segment_of(&self, key: &[u8]) -> Option<u32> {
        self.segment_map.as_ref().map(|map| map.segment_of(key))
    }

    pub fn primary_owner(&self, key: &[u8]) -> Option<&NodeAddress> {
        self.owners_of(key).first()
    }

    pub fn primary_segments_by_address(&self) -> HashMap<NodeAddress, BTreeSet<u32>> {
        self.segment_map
            .as_ref()
            .map(SegmentMap::primary_segments_by_address)
            .unwrap_or_default()
    }

    pub fn cache_topology_info(&self) -> CacheTopologyInfo {
        let mut segments_per_server: HashMap<NodeAddress, BTreeSet<u32>> = self
            .servers
            .iter()
            .map(|s| (s.clone(), BTreeSet::new()))
            .collect();
        if let Some(map) = &self.segment_map {
            for segment in 0..map.segment_count() {
                for owner in map.owners_of_segment(segment) {
                    segments_per_server
                        .entry(owner.clone())
                        .or_default()
                        .insert(segment);
                }
            }
        }
        CacheTopologyInfo {
            topology_id: self.epoch,
            num_segments: self.segment_map.as_ref().map(SegmentMap::segment_count),
            segments_per_server,
        }
    }
}

/// Atomically replaceable topology for one cache
#[derive(Debug)]
pub struct TopologyCell {
    current: RwLock<Arc<ClientTopology>>,
}

impl TopologyCell {
    pub fn new(initial: ClientTopology) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot; never blocks on writers for longer than a pointer swap
    pub fn current(&self) -> Arc<ClientTopology> {
        Arc::clone(&self.current.read())
    }

    /// Install `candidate` if its epoch is newer than the current one.
    ///
    /// Returns whether the snapshot was replaced. Stale or duplicate epochs
    /// are dropped, so racing updates settle on the highest epoch in any
    /// arrival order.
    pub fn update_if_newer(&self, candidate: ClientTopology) -> bool {
        let mut current = self.current.write();
        if candidate.epoch <= current.epoch {
            debug!(
                "Ignoring topology {} (current is {})",
                candidate.epoch, current.epoch
            );
            return false;
        }
        *current = Arc::new(candidate);
        true
    }
}

/// Registry of topology cells keyed by cache name
///
/// The empty cache name is the default cache; its cell doubles as the
/// process-wide fallback for caches that never received their own topology.
#[derive(Debug)]
pub struct TopologyRegistry {
    intelligence: ClientIntelligence,
    default: Arc<TopologyCell>,
    caches: RwLock<HashMap<Bytes, Arc<TopologyCell>>>,
}

impl TopologyRegistry {
    pub fn new(intelligence: ClientIntelligence, initial_servers: Vec<NodeAddress>) -> Self {
        Self {
            intelligence,
            default: Arc::new(TopologyCell::new(ClientTopology::initial(
                intelligence,
                initial_servers,
            ))),
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    /// The cell for `cache_name`, created on first use
    pub fn cell(&self, cache_name: &[u8]) -> Arc<TopologyCell> {
        if cache_name.is_empty() {
            return Arc::clone(&self.default);
        }
        if let Some(cell) = self.caches.read().get(cache_name) {
            return Arc::clone(cell);
        }
        let mut caches = self.caches.write();
        let cell = caches
            .entry(Bytes::copy_from_slice(cache_name))
            .or_insert_with(|| {
                let seeds = self.default.current().servers().to_vec();
                Arc::new(TopologyCell::new(ClientTopology::initial(
                    self.intelligence,
                    seeds,
                )))
            });
        Arc::clone(cell)
    }

    /// Current snapshot for `cache_name`, or the default one if the cache is
    /// not registered
    pub fn current(&self, cache_name: &[u8]) -> Arc<ClientTopology> {
        match self.caches.read().get(cache_name) {
            Some(cell) => cell.current(),
            None => self.default.current(),
        }
    }

    pub fn default_topology(&self) -> Arc<ClientTopology> {
        self.default.current()
    }

    pub fn update_if_newer(&self, cache_name: &[u8], candidate: ClientTopology) -> bool {
        let epoch = candidate.epoch();
        let cache = String::from_utf8_lossy(cache_name).into_owned();
        let applied = self.cell(cache_name).update_if_newer(candidate);
        if applied {
            info!("Installed topology {} for cache '{}'", epoch, cache);
        }
        metrics::record_topology_update(&cache, epoch, applied);
        applied
    }

    /// Apply a decoded wire topology
    pub fn apply_update(&self, cache_name: &[u8], update: TopologyUpdate) -> Result<bool> {
        let topology = ClientTopology::from_update(update, self.intelligence)?;
        Ok(self.update_if_newer(cache_name, topology))
    }

    /// Handle a topology the server pushed outside of a response
    pub fn on_topology_push(&self, cache_name: &[u8], payload: Bytes) -> Result<bool> {
        let mut payload = payload;
        let update = read_topology_update(&mut payload, self.intelligence)?;
        self.apply_update(cache_name, update)
    }

    pub fn primary_owners_by_address(&self, cache_name: &[u8]) -> HashMap<NodeAddress, BTreeSet<u32>> {
        self.current(cache_name).primary_segments_by_address()
    }

    pub fn cache_topology_info(&self, cache_name: &[u8]) -> CacheTopologyInfo {
        self.current(cache_name).cache_topology_info()
    }
}
