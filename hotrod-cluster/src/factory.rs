//! Operation construction for one cache
//!
//! [`OperationsFactory`] binds the cache name, topology cell, channel provider
//! and configuration into ready-to-run operations. It never touches the
//! network. Per-call flags travel in a [`CallContext`] owned by the caller,
//! so concurrent calls on a shared factory cannot see each other's flags.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::fanout::BulkRemoteOperation;
use crate::operations::auth::{AuthMechListOperation, AuthOperation};
use crate::operations::bulk::{GetAllOperation, PutAllOperation};
use crate::operations::cache::{
    BulkGetKeysOperation, ClearOperation, ExecOperation, PingOperation, SizeOperation,
    StatsOperation,
};
use crate::operations::iteration::{
    IterationCursor, IterationEndOperation, IterationNextOperation, IterationStartOperation,
};
use crate::operations::key::{
    ContainsKeyOperation, GetOperation, GetWithMetadataOperation, PutIfAbsentOperation,
    PutOperation, RemoveIfUnmodifiedOperation, RemoveOperation, ReplaceIfUnmodifiedOperation,
    ReplaceOperation,
};
use crate::operations::listener::{
    AddClientListenerOperation, FactoryRef, ListenerOptions, RemoveClientListenerOperation,
};
use crate::operations::stream::{GetStreamOperation, PutStreamOperation, StreamCondition};
use crate::operations::transaction::PrepareTransactionOperation;
use crate::operations::{Operation, OperationContext, RemoteOperation};
use crate::scan::{RemoteScan, ScanOptions};
use crate::topology::{ClientTopology, TopologyRegistry};
use crate::transport::ChannelProvider;
use crate::types::{
    CacheTopologyInfo, Expiration, Flags, ListenerRegistration, Modification, NodeAddress, Xid,
};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// Per-call state, owned by the caller and passed into each constructor
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    flags: Option<Flags>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(flags: Flags) -> Self {
        Self { flags: Some(flags) }
    }

    /// Set flags for the next operation built with this context
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = Some(flags);
    }

    pub fn has_pending_flags(&self) -> bool {
        self.flags.is_some()
    }

    /// Consume the pending flags; a second call yields `None`
    pub fn take_flags(&mut self) -> Option<Flags> {
        self.flags.take()
    }
}

/// Builds operations for one cache
#[derive(Clone)]
pub struct OperationsFactory {
    ctx: Arc<OperationContext>,
}

impl std::fmt::Debug for OperationsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationsFactory")
            .field("cache", &self.ctx.cache_label)
            .field("topology_id", &self.topology_id())
            .finish()
    }
}

impl OperationsFactory {
    /// Factory for `cache_name` (empty for the default cache)
    pub fn new(
        cache_name: &str,
        provider: Arc<dyn ChannelProvider>,
        registry: Arc<TopologyRegistry>,
        config: Arc<ClientConfig>,
    ) -> Self {
        let ctx = OperationContext::new(
            cache_name,
            provider,
            registry,
            config,
            Arc::new(AtomicU64::new(1)),
        );
        Self { ctx: Arc::new(ctx) }
    }

    /// Factory for another cache sharing this one's provider, registry,
    /// configuration and message id sequence
    pub fn for_cache(&self, cache_name: &str) -> Self {
        let ctx = OperationContext::new(
            cache_name,
            Arc::clone(&self.ctx.provider),
            Arc::clone(&self.ctx.registry),
            Arc::clone(&self.ctx.config),
            self.ctx.message_ids(),
        );
        Self { ctx: Arc::new(ctx) }
    }

    pub fn cache_name(&self) -> &str {
        &self.ctx.cache_label
    }

    /// Merge the call's pending flags (consumed) with the cache defaults.
    /// Call at most once per logical call.
    pub fn resolve_flags(&self, call: &mut CallContext) -> Flags {
        let mut flags = call.take_flags().unwrap_or(Flags::NONE);
        if self.ctx.config.force_return_values {
            flags |= Flags::FORCE_RETURN_VALUE;
        }
        flags
    }

    fn bind<O: Operation>(&self, call: &mut CallContext, op: O) -> RemoteOperation<O> {
        let flags = self.resolve_flags(call);
        RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), flags)
    }

    fn bind_expiring<O: Operation>(
        &self,
        call: &mut CallContext,
        expiration: &Expiration,
        op: O,
    ) -> RemoteOperation<O> {
        let flags = self.resolve_flags(call) | expiration.implied_flags();
        RemoteOperation::new(Arc::clone(&self.ctx), Arc::new(op), flags)
    }

    pub fn new_get(&self, call: &mut CallContext, key: impl Into<Bytes>) -> RemoteOperation<GetOperation> {
        self.bind(call, GetOperation::new(key.into()))
    }

    pub fn new_get_with_metadata(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
    ) -> RemoteOperation<GetWithMetadataOperation> {
        self.bind(call, GetWithMetadataOperation::new(key.into()))
    }

    pub fn new_contains_key(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
    ) -> RemoteOperation<ContainsKeyOperation> {
        self.bind(call, ContainsKeyOperation::new(key.into()))
    }

    pub fn new_put(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> RemoteOperation<PutOperation> {
        let op = PutOperation::new(key.into(), value.into(), expiration);
        self.bind_expiring(call, &expiration, op)
    }

    pub fn new_put_if_absent(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> RemoteOperation<PutIfAbsentOperation> {
        let op = PutIfAbsentOperation::new(key.into(), value.into(), expiration);
        self.bind_expiring(call, &expiration, op)
    }

    pub fn new_replace(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> RemoteOperation<ReplaceOperation> {
        let op = ReplaceOperation::new(key.into(), value.into(), expiration);
        self.bind_expiring(call, &expiration, op)
    }

    pub fn new_replace_if_unmodified(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: u64,
        expiration: Expiration,
    ) -> RemoteOperation<ReplaceIfUnmodifiedOperation> {
        let op = ReplaceIfUnmodifiedOperation::new(key.into(), value.into(), version, expiration);
        self.bind_expiring(call, &expiration, op)
    }

    pub fn new_remove(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
    ) -> RemoteOperation<RemoveOperation> {
        self.bind(call, RemoveOperation::new(key.into()))
    }

    pub fn new_remove_if_unmodified(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        version: u64,
    ) -> RemoteOperation<RemoveIfUnmodifiedOperation> {
        self.bind(call, RemoveIfUnmodifiedOperation::new(key.into(), version))
    }

    pub fn new_get_all(
        &self,
        call: &mut CallContext,
        keys: Vec<Bytes>,
    ) -> BulkRemoteOperation<GetAllOperation> {
        let flags = self.resolve_flags(call);
        BulkRemoteOperation::new(Arc::clone(&self.ctx), GetAllOperation::new(keys), flags)
    }

    pub fn new_put_all(
        &self,
        call: &mut CallContext,
        entries: Vec<(Bytes, Bytes)>,
        expiration: Expiration,
    ) -> BulkRemoteOperation<PutAllOperation> {
        let flags = self.resolve_flags(call) | expiration.implied_flags();
        BulkRemoteOperation::new(
            Arc::clone(&self.ctx),
            PutAllOperation::new(entries, expiration),
            flags,
        )
    }

    pub fn new_clear(&self, call: &mut CallContext) -> RemoteOperation<ClearOperation> {
        self.bind(call, ClearOperation)
    }

    pub fn new_size(&self, call: &mut CallContext) -> RemoteOperation<SizeOperation> {
        self.bind(call, SizeOperation)
    }

    pub fn new_stats(&self, call: &mut CallContext) -> RemoteOperation<StatsOperation> {
        self.bind(call, StatsOperation)
    }

    pub fn new_bulk_get_keys(
        &self,
        call: &mut CallContext,
        scope: u32,
    ) -> RemoteOperation<BulkGetKeysOperation> {
        self.bind(call, BulkGetKeysOperation::new(scope))
    }

    pub fn new_add_client_listener(
        &self,
        call: &mut CallContext,
        options: ListenerOptions,
    ) -> RemoteOperation<AddClientListenerOperation> {
        self.bind(call, AddClientListenerOperation::new(options))
    }

    pub fn new_remove_client_listener(
        &self,
        call: &mut CallContext,
        registration: &ListenerRegistration,
    ) -> RemoteOperation<RemoveClientListenerOperation> {
        self.bind(call, RemoveClientListenerOperation::new(registration))
    }

    /// Segment-aware scan over the whole cache (or `options.segments`)
    pub fn new_iteration(&self, call: &mut CallContext, options: ScanOptions) -> RemoteScan {
        let flags = self.resolve_flags(call);
        RemoteScan::new(Arc::clone(&self.ctx), flags, options)
    }

    pub fn new_iteration_start(
        &self,
        call: &mut CallContext,
        segments: Option<BTreeSet<u32>>,
        filter: Option<FactoryRef>,
        batch_size: u32,
        metadata: bool,
        target: Option<NodeAddress>,
    ) -> RemoteOperation<IterationStartOperation> {
        let op = IterationStartOperation::new(segments, filter, batch_size, metadata, target);
        self.bind(call, op)
    }

    pub fn new_iteration_next(
        &self,
        call: &mut CallContext,
        cursor: IterationCursor,
    ) -> RemoteOperation<IterationNextOperation> {
        self.bind(call, IterationNextOperation::new(cursor))
    }

    pub fn new_iteration_end(
        &self,
        call: &mut CallContext,
        cursor: IterationCursor,
    ) -> RemoteOperation<IterationEndOperation> {
        self.bind(call, IterationEndOperation::new(cursor))
    }

    pub fn new_get_stream(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        offset: u32,
    ) -> RemoteOperation<GetStreamOperation> {
        self.bind(call, GetStreamOperation::new(key.into(), offset))
    }

    /// Streamed write; with `version` it only runs if the entry is unmodified
    pub fn new_put_stream(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: Option<u64>,
        expiration: Expiration,
    ) -> RemoteOperation<PutStreamOperation> {
        let condition = match version {
            Some(version) => StreamCondition::IfVersion(version),
            None => StreamCondition::Always,
        };
        let op = PutStreamOperation::new(
            key.into(),
            value.into(),
            condition,
            expiration,
            self.ctx.config.stream_chunk_size,
        );
        // stream writes carry the expiration bytes only
        self.bind(call, op)
    }

    pub fn new_put_if_absent_stream(
        &self,
        call: &mut CallContext,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> RemoteOperation<PutStreamOperation> {
        let op = PutStreamOperation::new(
            key.into(),
            value.into(),
            StreamCondition::IfAbsent,
            expiration,
            self.ctx.config.stream_chunk_size,
        );
        self.bind(call, op)
    }

    pub fn new_ping(
        &self,
        call: &mut CallContext,
        address: NodeAddress,
    ) -> RemoteOperation<PingOperation> {
        self.bind(call, PingOperation::new(Some(address)))
    }

    /// Ping any reachable node, used to rediscover the topology
    pub fn new_fault_tolerant_ping(&self, call: &mut CallContext) -> RemoteOperation<PingOperation> {
        self.bind(call, PingOperation::new(None))
    }

    pub fn new_auth_mech_list(
        &self,
        call: &mut CallContext,
        address: NodeAddress,
    ) -> RemoteOperation<AuthMechListOperation> {
        self.bind(call, AuthMechListOperation::new(address))
    }

    pub fn new_auth(
        &self,
        call: &mut CallContext,
        address: NodeAddress,
        mechanism: &str,
        response: impl Into<Bytes>,
    ) -> RemoteOperation<AuthOperation> {
        self.bind(call, AuthOperation::new(address, mechanism, response.into()))
    }

    /// Rejects a null `xid` without building anything
    pub fn new_prepare_transaction(
        &self,
        call: &mut CallContext,
        xid: Xid,
        one_phase_commit: bool,
        recoverable: bool,
        timeout: Duration,
        modifications: Vec<Modification>,
    ) -> Result<RemoteOperation<PrepareTransactionOperation>> {
        let op = PrepareTransactionOperation::new(
            xid,
            one_phase_commit,
            recoverable,
            timeout,
            modifications,
        )?;
        Ok(self.bind(call, op))
    }

    pub fn new_execute(
        &self,
        call: &mut CallContext,
        task: &str,
        params: Vec<(String, Bytes)>,
        key: Option<Bytes>,
    ) -> RemoteOperation<ExecOperation> {
        self.bind(call, ExecOperation::new(task, params, key))
    }

    pub fn new_admin(
        &self,
        call: &mut CallContext,
        task: &str,
        params: Vec<(String, Bytes)>,
    ) -> RemoteOperation<ExecOperation> {
        self.bind(call, ExecOperation::admin(task, params))
    }

    pub fn current_topology(&self) -> Arc<ClientTopology> {
        self.ctx.topology.current()
    }

    pub fn topology_id(&self) -> i32 {
        self.ctx.topology.current().epoch()
    }

    pub fn primary_owners_by_address(&self) -> HashMap<NodeAddress, BTreeSet<u32>> {
        self.ctx.registry.primary_owners_by_address(&self.ctx.cache_name)
    }

    pub fn cache_topology_info(&self) -> CacheTopologyInfo {
        self.ctx.registry.cache_topology_info(&self.ctx.cache_name)
    }
}
