//! Remote operations and their execution state machine
//!
//! Every remote request is an [`Operation`]: it knows its opcode, how to
//! route itself, how to encode its body and how to decode the response
//! body. [`RemoteOperation`] binds one to a cache and a topology snapshot
//! and drives it through one or more attempts:
//!
//! ```text
//! Created -> ChannelAcquired -> Sent -> AwaitingResponse -> Completed
//!                                                        -> RetryTopology
//!                                                        -> Failed
//!                                                        -> Abandoned
//! ```
//!
//! Each attempt is a fresh [`attempt::Attempt`]; nothing carries over between
//! attempts except the request data and the deadline.

mod attempt;
pub mod auth;
pub mod bulk;
pub mod cache;
mod context;
pub mod iteration;
pub mod key;
pub mod listener;
pub mod stream;
pub mod transaction;

pub use attempt::OperationState;
pub(crate) use attempt::{Attempt, Outcome};
pub(crate) use context::OperationContext;

use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::topology::ClientTopology;
use crate::transport::ChannelTarget;
use crate::types::{Flags, NodeAddress};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How an operation picks its target node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Primary owner of the key under the bound topology
    Key(Bytes),
    /// A specific node (listeners, iterations, authentication)
    Address(NodeAddress),
    /// Any reachable node
    Any,
}

/// What an attempt does when its response says the topology changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyReaction {
    /// Discard the body and retry against the new topology. Only for
    /// requests that have no effect on the server, or whose repeat has none.
    Retry,
    /// Apply the new topology and decode the body as usual
    Complete,
}

/// What a decoder may know about the exchange besides the body
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub version: ProtocolVersion,
    pub address: &'a NodeAddress,
}

/// One kind of remote request
pub trait Operation: Send + Sync + 'static {
    type Output: Send + 'static;

    fn op_code(&self) -> OpCode;

    fn routing(&self) -> Routing {
        Routing::Any
    }

    /// Append the request body (everything after the header)
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut);

    /// Decode a non-error response body
    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output>;

    /// The server has already executed the request when it reports a new
    /// topology, so the body is kept unless the kind opts into a resend
    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Complete
    }
}

/// Pick the channel target for `routing` under `topology`, skipping owners
/// that already failed during this call
pub(crate) fn resolve_target(
    routing: &Routing,
    topology: &ClientTopology,
    failed: &HashSet<NodeAddress>,
) -> ChannelTarget {
    match routing {
        Routing::Key(key) => target_for_key(key, topology, failed),
        Routing::Address(address) => ChannelTarget::Address(address.clone()),
        Routing::Any => ChannelTarget::Any,
    }
}

/// First owner of `key` that has not failed yet, or any node
pub(crate) fn target_for_key(
    key: &[u8],
    topology: &ClientTopology,
    failed: &HashSet<NodeAddress>,
) -> ChannelTarget {
    topology
        .owners_of(key)
        .iter()
        .find(|owner| !failed.contains(*owner))
        .map(|owner| ChannelTarget::Address(owner.clone()))
        .unwrap_or(ChannelTarget::Any)
}

/// An operation bound to a cache, flags and topology snapshot
pub struct RemoteOperation<O: Operation> {
    ctx: Arc<OperationContext>,
    op: Arc<O>,
    flags: Flags,
    topology: Arc<ClientTopology>,
}

impl<O: Operation> std::fmt::Debug for RemoteOperation<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOperation")
            .field("op", &self.op.op_code())
            .field("cache", &self.ctx.cache_label)
            .field("flags", &self.flags)
            .field("topology_id", &self.topology.epoch())
            .finish()
    }
}

impl<O: Operation> RemoteOperation<O> {
    pub(crate) fn new(ctx: Arc<OperationContext>, op: Arc<O>, flags: Flags) -> Self {
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

    pub fn operation(&self) -> &O {
        &self.op
    }

    /// Topology snapshot this operation was created with
    pub fn topology(&self) -> &Arc<ClientTopology> {
        &self.topology
    }

    /// Node the first attempt would go to
    pub fn target(&self) -> ChannelTarget {
        resolve_target(&self.op.routing(), &self.topology, &HashSet::new())
    }

    /// Run to completion within the configured request timeout
    pub async fn execute(self) -> Result<O::Output> {
        let deadline = Instant::now() + self.ctx.config.request_timeout();
        self.execute_until(deadline).await
    }

    /// Run to completion, retrying on topology changes and connectivity
    /// failures until the retry budget or `deadline` runs out
    pub async fn execute_until(self, deadline: Instant) -> Result<O::Output> {
        let op_name = self.op.op_code().name();
        let limit = self.ctx.retry_limit(&self.topology);
        let mut topology = Arc::clone(&self.topology);
        let mut failed = HashSet::new();
        let mut last = String::from("no attempt completed");

        for attempt in 1..=limit {
            let target = resolve_target(&self.op.routing(), &topology, &failed);
            match self
                .attempt(Arc::clone(&topology), target.clone(), deadline)
                .await
            {
                Outcome::Completed(output) => return Ok(output),
                Outcome::Failed(e) => return Err(e),
                Outcome::RetryTopology => {
                    metrics::record_retry(op_name, "topology");
                    debug!(
                        "{} on '{}' hit a topology change at {} (attempt {}/{})",
                        op_name, self.ctx.cache_label, target, attempt, limit
                    );
                    last = format!("topology changed while talking to {}", target);
                }
                Outcome::RetryConnectivity(e) => {
                    metrics::record_retry(op_name, "connectivity");
                    warn!(
                        "{} on '{}' failed at {}: {} (attempt {}/{})",
                        op_name, self.ctx.cache_label, target, e, attempt, limit
                    );
                    if let ChannelTarget::Address(address) = &target {
                        failed.insert(address.clone());
                    }
                    last = e.to_string();
                    if attempt < limit {
                        self.ctx.refresh_topology(deadline).await;
                    }
                }
            }
            topology = self.ctx.topology.current();
        }

        Err(ClientError::TopologyUnstable {
            attempts: limit,
            last,
        })
    }

    /// One attempt against `target` using `topology`
    pub(crate) async fn attempt(
        &self,
        topology: Arc<ClientTopology>,
        target: ChannelTarget,
        deadline: Instant,
    ) -> Outcome<O::Output> {
        Attempt::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.op),
            self.flags,
            topology,
        )
        .run(target, deadline)
        .await
    }
}
