use super::cache::PingOperation;
use super::{Outcome, RemoteOperation};
use crate::codec::TopologyUpdate;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::topology::{ClientTopology, TopologyCell, TopologyRegistry};
use crate::transport::{ChannelProvider, ChannelTarget};
use crate::types::Flags;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Everything an operation of one cache needs besides its own request data
pub(crate) struct OperationContext {
    pub(crate) cache_name: Bytes,
    pub(crate) cache_label: String,
    pub(crate) provider: Arc<dyn ChannelProvider>,
    pub(crate) registry: Arc<TopologyRegistry>,
    pub(crate) topology: Arc<TopologyCell>,
    pub(crate) config: Arc<ClientConfig>,
    message_ids: Arc<AtomicU64>,
}

impl OperationContext {
    pub(crate) fn new(
        cache_name: &str,
        provider: Arc<dyn ChannelProvider>,
        registry: Arc<TopologyRegistry>,
        config: Arc<ClientConfig>,
        message_ids: Arc<AtomicU64>,
    ) -> Self {
        let cache_name_bytes = Bytes::copy_from_slice(cache_name.as_bytes());
        let topology = registry.cell(&cache_name_bytes);
        Self {
            cache_name: cache_name_bytes,
            cache_label: cache_name.to_string(),
            provider,
            registry,
            topology,
            config,
            message_ids,
        }
    }

    pub(crate) fn message_ids(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.message_ids)
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Attempts allowed for one logical call: the configured maximum, capped
    /// at cluster size + 1
    pub(crate) fn retry_limit(&self, topology: &ClientTopology) -> usize {
        self.config
            .max_retries
            .min(topology.cluster_size() + 1)
            .max(1)
    }

    pub(crate) fn apply_topology(&self, update: TopologyUpdate) -> Result<bool> {
        self.registry.apply_update(&self.cache_name, update)
    }

    /// Fault-tolerant discovery: ping any reachable node so the response
    /// carries a fresh topology if ours is stale
    pub(crate) async fn refresh_topology(self: &Arc<Self>, deadline: Instant) {
        let ping = RemoteOperation::new(
            Arc::clone(self),
            Arc::new(PingOperation::new(None)),
            Flags::NONE,
        );
        let before = self.topology.current().epoch();
        match ping.attempt(self.topology.current(), ChannelTarget::Any, deadline).await {
            Outcome::Completed(_) => debug!(
                "Topology refresh for '{}': epoch {} -> {}",
                self.cache_label,
                before,
                self.topology.current().epoch()
            ),
            Outcome::Failed(e) | Outcome::RetryConnectivity(e) => {
                warn!("Topology refresh for '{}' failed: {}", self.cache_label, e)
            }
            Outcome::RetryTopology => {}
        }
    }
}
