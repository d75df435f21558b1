//! Channel provider capability
//!
//! Connection management (pooling, TLS, reconnection) lives outside this
//! crate. Operations only see the [`ChannelProvider`] and [`Channel`]
//! traits: acquire a channel for an address or any address, write one
//! request frame, read one response frame, and give the channel back.

mod guard;

pub(crate) use guard::ChannelGuard;

use crate::codec::ProtocolVersion;
use crate::error::Result;
use crate::types::NodeAddress;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Where an operation wants its channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    /// The owner (or bound node) for this request
    Address(NodeAddress),
    /// Any reachable node
    Any,
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTarget::Address(addr) => write!(f, "{}", addr),
            ChannelTarget::Any => write!(f, "any"),
        }
    }
}

/// An established connection to one node
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Identifier unique within the provider
    fn id(&self) -> u64;

    /// Node this channel is connected to
    fn address(&self) -> &NodeAddress;

    /// Write one complete request frame
    async fn write_frame(&mut self, frame: Bytes) -> std::io::Result<()>;

    /// Read the next complete response frame.
    ///
    /// Must be cancel-safe: if the returned future is dropped before it
    /// completes, a later call still yields the whole frame.
    async fn read_frame(&mut self) -> std::io::Result<Bytes>;
}

/// Source of pooled channels shared by all operations of a client
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Acquire a channel; may suspend until one is available
    async fn acquire_channel(&self, target: &ChannelTarget) -> Result<Box<dyn Channel>>;

    /// Return a healthy channel to its pool
    fn release_channel(&self, channel: Box<dyn Channel>);

    /// Close a channel that may hold unread or corrupted data
    fn discard_channel(&self, channel: Box<dyn Channel>);

    /// Codec version agreed with the node behind `channel`
    fn negotiated_codec_version(&self, channel: &dyn Channel) -> ProtocolVersion;
}
