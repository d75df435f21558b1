//! Hot Rod Cluster - Topology-aware request routing for Hot Rod clients
//!
//! This crate sits between a cache API and a pool of connections to a
//! replicated, partitioned data grid. It builds remote operations, sends
//! each one to the node that owns its key, and keeps the client's view of
//! the cluster current from the topology updates servers piggyback on
//! responses.
//!
//! # Architecture
//!
//! - **Codec**: Hot Rod 2.5 to 3.1 request/response headers and primitives
//! - **Hashing**: MurmurHash3 segment mapping of keys
//! - **Topology**: Per-cache snapshots, replaced only by newer epochs
//! - **Operations**: One type per remote request, driven by a retrying
//!   state machine
//! - **Fan-out**: Multi-key calls split per owner and merged
//! - **Scan**: Segment-aware server-side iteration that survives rebalancing
//! - **Transport**: The [`ChannelProvider`] capability supplied by the
//!   connection layer
//!
//! # Key Operations
//!
//! - Keyed reads and writes, conditional and versioned writes
//! - get_all / put_all fanned out to primary owners
//! - Client listeners, streams, transactions, admin tasks
//! - Ping and fault-tolerant topology discovery

pub mod codec;
pub mod config;
pub mod consistent_hash;
pub mod error;
pub mod factory;
pub mod fanout;
pub mod hash;
pub mod metrics;
pub mod operations;
pub mod scan;
pub mod topology;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use codec::{OpCode, ProtocolVersion, ResponseStatus, TopologyUpdate};
pub use config::ClientConfig;
pub use consistent_hash::SegmentMap;
pub use error::{ClientError, Result};
pub use factory::{CallContext, OperationsFactory};
pub use fanout::BulkRemoteOperation;
pub use operations::iteration::{IterationCursor, IterationPage, ScanEntry};
pub use operations::listener::{FactoryRef, ListenerOptions};
pub use operations::stream::StreamCondition;
pub use operations::{Operation, OperationState, RemoteOperation, Routing};
pub use scan::{KeyTracker, RemoteScan, ScanOptions, ScanState};
pub use topology::{ClientTopology, TopologyRegistry, NO_TOPOLOGY};
pub use transport::{Channel, ChannelProvider, ChannelTarget};
pub use types::*;
