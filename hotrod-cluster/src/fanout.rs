//! Multi-key fan-out
//!
//! A bulk call is split into one sub-batch per primary owner, run
//! concurrently, and merged. Failure semantics are fail-fast on the result
//! but not on the work: every sub-batch is awaited even after one fails, and
//! the caller only ever sees either the full merged result or the first
//! failure. Sub-batches that come back with a topology change are
//! re-partitioned against the refreshed snapshot; the others are kept.

use crate::error::{ClientError, Result};
use crate::metrics;
use crate::operations::bulk::BulkOperation;
use crate::operations::{target_for_key, Operation, OperationContext, Outcome, RemoteOperation};
use crate::topology::ClientTopology;
use crate::transport::ChannelTarget;
use crate::types::{Flags, NodeAddress};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Group items by the node that should receive them
pub(crate) fn partition<O: BulkOperation>(
    items: &[O::Item],
    topology: &ClientTopology,
    failed: &HashSet<NodeAddress>,
) -> HashMap<ChannelTarget, Vec<O::Item>> {
    let mut batches: HashMap<ChannelTarget, Vec<O::Item>> = HashMap::new();
    for item in items {
        let target = target_for_key(O::item_key(item), topology, failed);
        batches.entry(target).or_default().push(item.clone());
    }
    batches
}

/// A bulk operation bound to a cache, flags and topology snapshot
pub struct BulkRemoteOperation<O: BulkOperation> {
    ctx: Arc<OperationContext>,
    op: O,
    flags: Flags,
    topology: Arc<ClientTopology>,
}

impl<O: BulkOperation> BulkRemoteOperation<O> {
    pub(crate) fn new(ctx: Arc<OperationContext>, op: O, flags: Flags) -> Self {
        let topology = ctx.topology.current();
        Self {
            ctx,
            op,
            flags,
            topology,
        }
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Sub-batches the first round would send
    pub fn batches(&self) -> HashMap<ChannelTarget, Vec<O::Item>> {
        partition::<O>(self.op.items(), &self.topology, &HashSet::new())
    }

    pub async fn execute(self) -> Result<O::Output> {
        let deadline = Instant::now() + self.ctx.config.request_timeout();
        self.execute_until(deadline).await
    }

    pub async fn execute_until(self, deadline: Instant) -> Result<O::Output> {
        let op_name = self.op.op_code().name();
        let limit = self.ctx.retry_limit(&self.topology);
        let mut topology = Arc::clone(&self.topology);
        let mut failed = HashSet::new();
        let mut merged = O::empty_output();
        let mut last = String::from("no round completed");

        let mut pending: Vec<(ChannelTarget, Vec<O::Item>)> = self.batches().into_iter().collect();
        if pending.is_empty() {
            return Ok(merged);
        }

        for round in 1..=limit {
            metrics::record_fanout_batches(op_name, pending.len());
            debug!(
                "{} on '{}': round {}/{} with {} sub-batches",
                op_name,
                self.ctx.cache_label,
                round,
                limit,
                pending.len()
            );

            let mut in_flight = FuturesUnordered::new();
            for (target, items) in pending.drain(..) {
                let sub = RemoteOperation::new(
                    Arc::clone(&self.ctx),
                    Arc::new(self.op.with_items(items.clone())),
                    self.flags,
                );
                let topology = Arc::clone(&topology);
                in_flight.push(async move {
                    let outcome = sub.attempt(topology, target.clone(), deadline).await;
                    (target, items, outcome)
                });
            }

            let mut failure: Option<ClientError> = None;
            let mut retry_items = Vec::new();
            let mut connectivity = false;
            while let Some((target, items, outcome)) = in_flight.next().await {
                match outcome {
                    Outcome::Completed(part) => {
                        if failure.is_none() {
                            O::merge(&mut merged, part);
                        }
                    }
                    Outcome::Failed(e) => {
                        warn!("{} sub-batch to {} failed: {}", op_name, target, e);
                        failure.get_or_insert(e);
                    }
                    Outcome::RetryTopology => {
                        metrics::record_retry(op_name, "topology");
                        last = format!("topology changed while talking to {}", target);
                        retry_items.extend(items);
                    }
                    Outcome::RetryConnectivity(e) => {
                        metrics::record_retry(op_name, "connectivity");
                        if let ChannelTarget::Address(address) = &target {
                            failed.insert(address.clone());
                        }
                        last = e.to_string();
                        connectivity = true;
                        retry_items.extend(items);
                    }
                }
            }

            if let Some(e) = failure {
                return Err(e);
            }
            if retry_items.is_empty() {
                return Ok(merged);
            }
            if round == limit {
                break;
            }
            if connectivity {
                self.ctx.refresh_topology(deadline).await;
            }
            topology = self.ctx.topology.current();
            pending = partition::<O>(&retry_items, &topology, &failed)
                .into_iter()
                .collect();
        }

        Err(ClientError::TopologyUnstable {
            attempts: limit,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpCode;
    use crate::factory::CallContext;
    use crate::hash;
    use crate::test_support::{addr, keys_covering_segments, FakeCluster};
    use crate::types::Expiration;
    use bytes::Bytes;

    fn three_owner_cluster() -> FakeCluster {
        FakeCluster::new(vec![vec![addr("a")], vec![addr("b")], vec![addr("c")]])
    }

    fn entries(keys: &[Bytes]) -> Vec<(Bytes, Bytes)> {
        keys.iter().map(|k| (k.clone(), k.clone())).collect()
    }

    #[tokio::test]
    async fn test_put_all_sends_one_sub_batch_per_owner() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let keys = keys_covering_segments(3, 2);

        let op = factory.new_put_all(&mut CallContext::new(), entries(&keys), Expiration::default());
        assert_eq!(op.batches().len(), 3);
        op.execute().await.unwrap();

        let put_alls = cluster.requests_for(OpCode::PutAll);
        assert_eq!(put_alls.len(), 3);
        let targets: HashSet<_> = put_alls.iter().map(|r| r.address.clone()).collect();
        assert_eq!(targets.len(), 3);
        for key in &keys {
            assert_eq!(cluster.stored(key), Some(key.clone()));
        }
    }

    #[tokio::test]
    async fn test_one_failed_sub_batch_fails_the_whole_call() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let keys = keys_covering_segments(3, 1);
        for key in &keys {
            cluster.insert(key.clone(), Bytes::from_static(b"v"));
        }
        cluster.fail_requests_at(&addr("b"), 0x85, usize::MAX);

        let result = factory
            .new_get_all(&mut CallContext::new(), keys.clone())
            .execute()
            .await;
        match result {
            Err(ClientError::Server { status, .. }) => assert_eq!(status, 0x85),
            other => panic!("expected server error, got {:?}", other),
        }
        // every sub-batch ran to completion and gave its channel back
        assert_eq!(cluster.requests_for(OpCode::GetAll).len(), 3);
        cluster.assert_all_channels_returned_once();
    }

    #[tokio::test]
    async fn test_get_all_merges_results_from_all_owners() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let keys = keys_covering_segments(3, 3);
        for key in &keys[1..] {
            cluster.insert(key.clone(), Bytes::from_static(b"v"));
        }

        let found = factory
            .new_get_all(&mut CallContext::new(), keys.clone())
            .execute()
            .await
            .unwrap();
        assert_eq!(found.len(), keys.len() - 1);
        assert!(!found.contains_key(&keys[0]));
    }

    #[tokio::test]
    async fn test_stale_sub_batches_are_repartitioned() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let keys = keys_covering_segments(3, 1);
        let moved_segment = hash::segment_of(&keys[0], 3) as usize;

        let op = factory.new_put_all(&mut CallContext::new(), entries(&keys), Expiration::default());
        let mut owners = vec![vec![addr("a")], vec![addr("b")], vec![addr("c")]];
        owners[moved_segment] = vec![addr("d")];
        cluster.set_owners(owners);

        op.execute().await.unwrap();
        let put_alls = cluster.requests_for(OpCode::PutAll);
        // first round hits a, b and c with the stale id; all three carry the
        // new topology back, so the second round goes to the new owners
        assert_eq!(put_alls.len(), 6);
        assert!(put_alls.iter().any(|r| r.address == addr("d")));
        assert_eq!(factory.topology_id(), 2);
    }

    #[tokio::test]
    async fn test_only_signalled_sub_batch_is_resent() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let keys = keys_covering_segments(3, 2);
        let moved_segment = hash::segment_of(&keys[0], 3) as usize;
        assert_eq!(moved_segment, 0);

        let op = factory.new_put_all(&mut CallContext::new(), entries(&keys), Expiration::default());
        cluster.set_owners(vec![vec![addr("d")], vec![addr("b")], vec![addr("c")]]);
        // b and c answer without the new topology, as if they had not seen it
        cluster.withhold_topology_at(&addr("b"));
        cluster.withhold_topology_at(&addr("c"));

        op.execute().await.unwrap();

        let put_alls = cluster.requests_for(OpCode::PutAll);
        let count_at = |node: &str| put_alls.iter().filter(|r| r.address == addr(node)).count();
        assert_eq!(put_alls.len(), 4);
        assert_eq!(count_at("a"), 1);
        assert_eq!(count_at("b"), 1);
        assert_eq!(count_at("c"), 1);
        assert_eq!(count_at("d"), 1);
        let resent = put_alls.iter().find(|r| r.address == addr("d")).unwrap();
        assert_eq!(resent.topology_id, 2);
        for key in &keys {
            assert_eq!(cluster.stored(key), Some(key.clone()));
        }
        assert_eq!(factory.topology_id(), 2);
        cluster.assert_all_channels_returned_once();
    }

    #[tokio::test]
    async fn test_empty_bulk_call_sends_nothing() {
        let cluster = three_owner_cluster();
        let factory = cluster.factory("books");
        let found = factory
            .new_get_all(&mut CallContext::new(), vec![])
            .execute()
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(cluster.request_count(), 0);
    }
}
