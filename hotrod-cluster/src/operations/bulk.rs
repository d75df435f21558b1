//! Multi-key operations, split per primary owner by the fan-out layer

use super::{DecodeContext, Operation, TopologyReaction};
use crate::codec::wire::{read_array, read_vint, write_array, write_expiration, write_vint};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::Result;
use crate::types::Expiration;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// An operation over many keys that can be split into independent
/// sub-batches and whose partial results can be merged
pub trait BulkOperation: Operation + Sized {
    type Item: Clone + Send + Sync + 'static;

    fn items(&self) -> &[Self::Item];

    fn item_key(item: &Self::Item) -> &[u8];

    /// Same request restricted to `items`
    fn with_items(&self, items: Vec<Self::Item>) -> Self;

    fn empty_output() -> Self::Output;

    fn merge(into: &mut Self::Output, part: Self::Output);
}

#[derive(Debug, Clone)]
pub struct GetAllOperation {
    keys: Vec<Bytes>,
}

impl GetAllOperation {
    pub fn new(keys: Vec<Bytes>) -> Self {
        Self { keys }
    }
}

impl Operation for GetAllOperation {
    type Output = HashMap<Bytes, Bytes>;

    fn op_code(&self) -> OpCode {
        OpCode::GetAll
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_vint(buf, self.keys.len() as u32);
        for key in &self.keys {
            write_array(buf, key);
        }
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        let count = read_vint(body)? as usize;
        let mut entries = HashMap::with_capacity(count.min(self.keys.len()));
        for _ in 0..count {
            let key = read_array(body)?;
            let value = read_array(body)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

impl BulkOperation for GetAllOperation {
    type Item = Bytes;

    fn items(&self) -> &[Bytes] {
        &self.keys
    }

    fn item_key(item: &Bytes) -> &[u8] {
        item
    }

    fn with_items(&self, items: Vec<Bytes>) -> Self {
        Self::new(items)
    }

    fn empty_output() -> Self::Output {
        HashMap::new()
    }

    fn merge(into: &mut Self::Output, part: Self::Output) {
        into.extend(part);
    }
}

#[derive(Debug, Clone)]
pub struct PutAllOperation {
    entries: Vec<(Bytes, Bytes)>,
    expiration: Expiration,
}

impl PutAllOperation {
    pub fn new(entries: Vec<(Bytes, Bytes)>, expiration: Expiration) -> Self {
        Self {
            entries,
            expiration,
        }
    }
}

impl Operation for PutAllOperation {
    type Output = ();

    fn op_code(&self) -> OpCode {
        OpCode::PutAll
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_expiration(buf, &self.expiration);
        write_vint(buf, self.entries.len() as u32);
        for (key, value) in &self.entries {
            write_array(buf, key);
            write_array(buf, value);
        }
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    // unconditional; the fan-out re-partitions only this sub-batch
    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

impl BulkOperation for PutAllOperation {
    type Item = (Bytes, Bytes);

    fn items(&self) -> &[(Bytes, Bytes)] {
        &self.entries
    }

    fn item_key(item: &(Bytes, Bytes)) -> &[u8] {
        &item.0
    }

    fn with_items(&self, items: Vec<(Bytes, Bytes)>) -> Self {
        Self::new(items, self.expiration)
    }

    fn empty_output() {}

    fn merge(_into: &mut (), _part: ()) {}
}
