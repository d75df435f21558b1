//! Segment-aware remote scans
//!
//! A [`RemoteScan`] walks the cache owner by owner: the segments still to
//! be delivered are grouped by their primary owner and one server iteration
//! runs per group. When a page comes back with a topology change the
//! current cursor is ended, the unfinished segments are regrouped against
//! the new snapshot, and entries already delivered are filtered out by the
//! [`KeyTracker`].

use crate::error::{ClientError, Result};
use crate::hash;
use crate::metrics;
use crate::operations::iteration::{
    IterationCursor, IterationEndOperation, IterationNextOperation, IterationPage,
    IterationStartOperation, ScanEntry,
};
use crate::operations::listener::FactoryRef;
use crate::operations::{OperationContext, Outcome, RemoteOperation};
use crate::topology::ClientTopology;
use crate::transport::ChannelTarget;
use crate::types::{Flags, NodeAddress};
use bytes::Bytes;
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What to scan and how
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Entries per page; the configured default when `None`
    pub batch_size: Option<u32>,
    pub metadata: bool,
    /// Server-side filter/converter factory
    pub filter: Option<FactoryRef>,
    /// Restrict the scan to these segments
    pub segments: Option<BTreeSet<u32>>,
}

/// Keys delivered so far, per segment, until the segment is complete
#[derive(Debug, Default)]
pub struct KeyTracker {
    seen: HashMap<Option<u32>, HashSet<Bytes>>,
    completed: BTreeSet<u32>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`; false if it was already delivered
    pub fn track(&mut self, segment: Option<u32>, key: &Bytes) -> bool {
        if let Some(segment) = segment {
            if self.completed.contains(&segment) {
                return false;
            }
        }
        self.seen.entry(segment).or_default().insert(key.clone())
    }

    /// Mark a segment fully delivered and forget its keys
    pub fn complete_segment(&mut self, segment: u32) {
        self.completed.insert(segment);
        self.seen.remove(&Some(segment));
    }

    /// File keys tracked before the segment count was known under their
    /// segments, so a re-scan by segment still recognises them
    pub fn assign_segments(&mut self, segment_count: u32) {
        let Some(unassigned) = self.seen.remove(&None) else {
            return;
        };
        for key in unassigned {
            let segment = hash::segment_of(&key, segment_count);
            if !self.completed.contains(&segment) {
                self.seen.entry(Some(segment)).or_default().insert(key);
            }
        }
    }

    pub fn is_complete(&self, segment: u32) -> bool {
        self.completed.contains(&segment)
    }

    pub fn completed_segments(&self) -> &BTreeSet<u32> {
        &self.completed
    }
}

/// Segments (or the whole cache) assigned to one server iteration
#[derive(Debug, Clone)]
struct ScanGroup {
    target: Option<NodeAddress>,
    segments: Option<BTreeSet<u32>>,
}

#[derive(Debug)]
struct ActiveIteration {
    cursor: IterationCursor,
    segments: Option<BTreeSet<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    NotStarted,
    Running,
    Ended,
}

/// A scan over a cache, yielding each key at most once
pub struct RemoteScan {
    ctx: Arc<OperationContext>,
    flags: Flags,
    options: ScanOptions,
    segment_count: Option<u32>,
    tracker: KeyTracker,
    plan: VecDeque<ScanGroup>,
    active: Option<ActiveIteration>,
    state: ScanState,
    failures: usize,
}

impl std::fmt::Debug for RemoteScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteScan")
            .field("cache", &self.ctx.cache_label)
            .field("state", &self.state)
            .field("completed_segments", &self.tracker.completed_segments().len())
            .field("pending_groups", &self.plan.len())
            .finish()
    }
}

impl RemoteScan {
    pub(crate) fn new(ctx: Arc<OperationContext>, flags: Flags, options: ScanOptions) -> Self {
        Self {
            ctx,
            flags,
            options,
            segment_count: None,
            tracker: KeyTracker::new(),
            plan: VecDeque::new(),
            active: None,
            state: ScanState::NotStarted,
            failures: 0,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn tracker(&self) -> &KeyTracker {
        &self.tracker
    }

    fn batch_size(&self) -> u32 {
        self.options
            .batch_size
            .unwrap_or(self.ctx.config.iteration_batch_size)
    }

    fn remaining_segments(&self) -> Option<BTreeSet<u32>> {
        let all: BTreeSet<u32> = match (&self.options.segments, self.segment_count) {
            (Some(requested), _) => requested.clone(),
            (None, Some(count)) => (0..count).collect(),
            (None, None) => return None,
        };
        Some(
            all.into_iter()
                .filter(|s| !self.tracker.is_complete(*s))
                .collect(),
        )
    }

    /// Group unfinished segments by primary owner under `topology`
    fn replan(&mut self, topology: &ClientTopology) {
        self.plan.clear();
        let map = match topology.segment_map() {
            Some(map) if self.segment_count.map_or(true, |c| c == map.segment_count()) => map,
            _ => {
                let segments = self.remaining_segments();
                if segments.as_ref().map_or(true, |s| !s.is_empty()) {
                    self.plan.push_back(ScanGroup {
                        target: None,
                        segments,
                    });
                }
                return;
            }
        };
        if self.segment_count.is_none() {
            self.segment_count = Some(map.segment_count());
            self.tracker.assign_segments(map.segment_count());
        }

        let mut groups: BTreeMap<Option<NodeAddress>, BTreeSet<u32>> = BTreeMap::new();
        for segment in self.remaining_segments().unwrap_or_default() {
            let owner = map.primary_of_segment(segment).cloned();
            groups.entry(owner).or_default().insert(segment);
        }
        for (target, segments) in groups {
            self.plan.push_back(ScanGroup {
                target,
                segments: Some(segments),
            });
        }
        debug!(
            "Scan on '{}' planned {} groups at topology {}",
            self.ctx.cache_label,
            self.plan.len(),
            topology.epoch()
        );
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.ctx.config.request_timeout()
    }

    async fn start(&mut self, group: ScanGroup) -> Result<()> {
        let op = IterationStartOperation::new(
            group.segments.clone(),
            self.options.filter.clone(),
            self.batch_size(),
            self.options.metadata,
            group.target,
        );
        let cursor = RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), self.flags)
            .execute_until(self.deadline())
            .await?;
        debug!(
            "Scan on '{}' started iteration {} at {}",
            self.ctx.cache_label, cursor.iteration_id, cursor.address
        );
        self.active = Some(ActiveIteration {
            cursor,
            segments: group.segments,
        });
        Ok(())
    }

    async fn end_active(&mut self) {
        if let Some(active) = self.active.take() {
            let op = IterationEndOperation::new(active.cursor);
            let end = RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), self.flags);
            if let Err(e) = end.execute_until(self.deadline()).await {
                debug!("Ending iteration on '{}' failed: {}", self.ctx.cache_label, e);
            }
        }
    }

    fn segment_of(&self, key: &[u8]) -> Option<u32> {
        self.segment_count.map(|count| hash::segment_of(key, count))
    }

    fn accept(&mut self, page: IterationPage, group_segments: Option<&BTreeSet<u32>>) -> Vec<ScanEntry> {
        let mut fresh = Vec::with_capacity(page.entries.len());
        let mut duplicates = 0;
        for entry in page.entries {
            let segment = self.segment_of(&entry.key);
            if self.tracker.track(segment, &entry.key) {
                fresh.push(entry);
            } else {
                duplicates += 1;
            }
        }
        for segment in page.finished_segments {
            if group_segments.map_or(true, |s| s.contains(&segment)) {
                self.tracker.complete_segment(segment);
            }
        }
        if duplicates > 0 {
            debug!("Scan on '{}' dropped {} repeated entries", self.ctx.cache_label, duplicates);
            metrics::record_scan_duplicates(duplicates);
        }
        fresh
    }

    async fn on_retry(&mut self, cause: &str, connectivity: bool) -> Result<()> {
        self.failures += 1;
        let topology = self.ctx.topology.current();
        let limit = self.ctx.retry_limit(&topology);
        metrics::record_retry("iteration_next", cause);
        if self.failures > limit {
            return Err(ClientError::TopologyUnstable {
                attempts: self.failures,
                last: format!("scan interrupted by {}", cause),
            });
        }
        self.end_active().await;
        if connectivity {
            self.ctx.refresh_topology(self.deadline()).await;
        }
        let topology = self.ctx.topology.current();
        self.replan(&topology);
        Ok(())
    }

    /// Next batch of entries, or `None` once every segment is delivered
    pub async fn next_page(&mut self) -> Result<Option<Vec<ScanEntry>>> {
        loop {
            match self.state {
                ScanState::Ended => return Ok(None),
                ScanState::NotStarted => {
                    let topology = self.ctx.topology.current();
                    self.replan(&topology);
                    self.state = ScanState::Running;
                }
                ScanState::Running => {}
            }

            if self.active.is_none() {
                match self.plan.pop_front() {
                    Some(group) => {
                        if let Err(e) = self.start(group.clone()).await {
                            // keep the group so the next call starts it again
                            self.plan.push_front(group);
                            return Err(e);
                        }
                    }
                    None => {
                        self.state = ScanState::Ended;
                        return Ok(None);
                    }
                }
            }
            let Some(cursor) = self.active.as_ref().map(|a| a.cursor.clone()) else {
                continue;
            };

            let op = IterationNextOperation::new(cursor.clone());
            let next = RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), self.flags);
            let topology = self.ctx.topology.current();
            let target = ChannelTarget::Address(cursor.address.clone());
            match next.attempt(topology, target, self.deadline()).await {
                Outcome::Completed(page) if page.is_last() => {
                    let finished = self.active.take().and_then(|a| a.segments);
                    self.accept(page, finished.as_ref());
                    if let Some(segments) = finished {
                        for segment in segments {
                            self.tracker.complete_segment(segment);
                        }
                    }
                    let end = IterationEndOperation::new(cursor);
                    let end = RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(end), self.flags);
                    if let Err(e) = end.execute_until(self.deadline()).await {
                        debug!("Ending drained iteration failed: {}", e);
                    }
                }
                Outcome::Completed(page) => {
                    self.failures = 0;
                    let segments = self.active.as_ref().and_then(|a| a.segments.clone());
                    let fresh = self.accept(page, segments.as_ref());
                    if !fresh.is_empty() {
                        return Ok(Some(fresh));
                    }
                }
                Outcome::RetryTopology => {
                    debug!(
                        "Scan on '{}' saw a topology change, regrouping unfinished segments",
                        self.ctx.cache_label
                    );
                    self.on_retry("topology", false).await?;
                }
                Outcome::RetryConnectivity(e) => {
                    warn!("Scan on '{}' lost {}: {}", self.ctx.cache_label, cursor.address, e);
                    self.active = None;
                    self.on_retry("connectivity", true).await?;
                }
                Outcome::Failed(e) => {
                    self.end_active().await;
                    self.state = ScanState::Ended;
                    return Err(e);
                }
            }
        }
    }

    /// End the server iteration, if any, and stop the scan
    pub async fn close(mut self) -> Result<()> {
        self.end_active().await;
        self.state = ScanState::Ended;
        Ok(())
    }

    /// Flatten the scan into a stream of entries
    pub fn into_stream(self) -> impl Stream<Item = Result<ScanEntry>> {
        stream::try_unfold(self, |mut scan| async move {
            Ok::<_, ClientError>(scan.next_page().await?.map(|page| (page, scan)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<ScanEntry, ClientError>)))
        .try_flatten()
    }
}

impl Drop for RemoteScan {
    fn drop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let op = IterationEndOperation::new(active.cursor);
        let end = RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), self.flags);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = end.execute().await {
                        debug!("Ending abandoned iteration failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Scan dropped outside a runtime, iteration left to expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpCode;
    use crate::factory::CallContext;
    use crate::test_support::{addr, keys_covering_segments, FakeCluster};
    use futures::TryStreamExt;

    #[test]
    fn test_tracker_filters_repeats_until_segment_completes() {
        let mut tracker = KeyTracker::new();
        let key = Bytes::from_static(b"k");
        assert!(tracker.track(Some(1), &key));
        assert!(!tracker.track(Some(1), &key));

        tracker.complete_segment(1);
        assert!(tracker.is_complete(1));
        assert!(!tracker.track(Some(1), &key));
        assert!(tracker.track(Some(2), &key));
    }

    #[test]
    fn test_tracker_without_segments() {
        let mut tracker = KeyTracker::new();
        let key = Bytes::from_static(b"k");
        assert!(tracker.track(None, &key));
        assert!(!tracker.track(None, &key));
    }

    #[test]
    fn test_tracker_files_unassigned_keys_under_their_segments() {
        let keys = keys_covering_segments(2, 2);
        let mut tracker = KeyTracker::new();
        for key in &keys {
            assert!(tracker.track(None, key));
        }
        tracker.complete_segment(1);
        tracker.assign_segments(2);

        for key in &keys {
            let segment = hash::segment_of(key, 2);
            assert!(!tracker.track(Some(segment), key));
        }
        assert!(!tracker.seen.contains_key(&None));
        assert!(!tracker.seen.contains_key(&Some(1)));
    }

    fn seeded_cluster(keys: &[Bytes]) -> FakeCluster {
        let cluster = FakeCluster::new(vec![vec![addr("a")], vec![addr("b")]]);
        for key in keys {
            cluster.insert(key.clone(), key.clone());
        }
        cluster
    }

    fn options(batch: u32) -> ScanOptions {
        ScanOptions {
            batch_size: Some(batch),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scan_visits_each_owner_once() {
        let keys = keys_covering_segments(2, 5);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books");

        let mut scan = factory.new_iteration(&mut CallContext::new(), options(3));
        let mut seen = HashSet::new();
        while let Some(page) = scan.next_page().await.unwrap() {
            for entry in page {
                assert!(seen.insert(entry.key));
            }
        }
        assert_eq!(seen.len(), keys.len());
        assert_eq!(scan.state(), ScanState::Ended);

        let starts = cluster.requests_for(OpCode::IterationStart);
        let targets: HashSet<_> = starts.iter().map(|r| r.address.clone()).collect();
        assert_eq!(targets, [addr("a"), addr("b")].into_iter().collect());
        assert_eq!(cluster.open_iterations(), 0);
    }

    #[tokio::test]
    async fn test_topology_change_mid_scan_yields_each_key_once() {
        let keys = keys_covering_segments(2, 6);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books");

        let mut scan = factory.new_iteration(&mut CallContext::new(), options(4));
        let mut delivered: Vec<Bytes> = Vec::new();
        let first = scan.next_page().await.unwrap().unwrap();
        delivered.extend(first.into_iter().map(|e| e.key));

        // both segments move to a new node after the first page
        cluster.set_owners(vec![vec![addr("c")], vec![addr("c")]]);

        while let Some(page) = scan.next_page().await.unwrap() {
            delivered.extend(page.into_iter().map(|e| e.key));
        }

        let distinct: HashSet<_> = delivered.iter().cloned().collect();
        assert_eq!(distinct.len(), delivered.len(), "a key was delivered twice");
        assert_eq!(distinct.len(), keys.len());
        assert!(cluster
            .requests_for(OpCode::IterationStart)
            .iter()
            .any(|r| r.address == addr("c")));
        assert_eq!(cluster.open_iterations(), 0);
    }

    #[tokio::test]
    async fn test_keys_seen_before_first_segment_map_are_not_repeated() {
        let keys = keys_covering_segments(2, 6);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books").for_cache("authors");
        assert_eq!(factory.topology_id(), crate::topology::NO_TOPOLOGY);

        let mut scan = factory.new_iteration(&mut CallContext::new(), options(4));
        let mut delivered: Vec<Bytes> = Vec::new();
        let first = scan.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        delivered.extend(first.into_iter().map(|e| e.key));

        cluster.set_owners(vec![vec![addr("c")], vec![addr("c")]]);
        while let Some(page) = scan.next_page().await.unwrap() {
            delivered.extend(page.into_iter().map(|e| e.key));
        }

        let distinct: HashSet<_> = delivered.iter().cloned().collect();
        assert_eq!(distinct.len(), delivered.len(), "a key was delivered twice");
        assert_eq!(distinct.len(), 12);
        assert_eq!(cluster.open_iterations(), 0);
    }

    #[tokio::test]
    async fn test_failed_iteration_start_is_attempted_again() {
        let keys = keys_covering_segments(2, 3);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books");
        cluster.fail_requests_at(&addr("a"), 0x85, 1);

        let mut scan = factory.new_iteration(&mut CallContext::new(), options(10));
        let err = scan.next_page().await.unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 0x85, .. }));
        assert_eq!(scan.state(), ScanState::Running);

        let mut seen = HashSet::new();
        while let Some(page) = scan.next_page().await.unwrap() {
            for entry in page {
                assert!(seen.insert(entry.key));
            }
        }
        assert_eq!(seen.len(), keys.len());

        let starts_at_a = cluster
            .requests_for(OpCode::IterationStart)
            .iter()
            .filter(|r| r.address == addr("a"))
            .count();
        assert_eq!(starts_at_a, 2);
        assert_eq!(cluster.open_iterations(), 0);
    }

    #[tokio::test]
    async fn test_scan_restricted_to_segments() {
        let keys = keys_covering_segments(2, 4);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books");

        let only: BTreeSet<u32> = [1].into_iter().collect();
        let scan = factory.new_iteration(
            &mut CallContext::new(),
            ScanOptions {
                segments: Some(only),
                ..options(10)
            },
        );
        let entries: Vec<ScanEntry> = scan.into_stream().try_collect().await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| hash::segment_of(&e.key, 2) == 1));
    }

    #[tokio::test]
    async fn test_dropping_a_scan_ends_its_iteration() {
        let keys = keys_covering_segments(2, 5);
        let cluster = seeded_cluster(&keys);
        let factory = cluster.factory("books");

        let mut scan = factory.new_iteration(&mut CallContext::new(), options(2));
        scan.next_page().await.unwrap().unwrap();
        assert_eq!(cluster.open_iterations(), 1);
        drop(scan);

        for _ in 0..50 {
            if cluster.open_iterations() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.open_iterations(), 0);
    }
}
