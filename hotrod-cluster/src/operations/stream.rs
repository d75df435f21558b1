//! Streamed reads and chunked writes of large values

use super::key::read_entry_metadata;
use super::{DecodeContext, Operation, Routing, TopologyReaction};
use crate::codec::wire::{read_array, write_array, write_expiration, write_vint};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::Result;
use crate::types::{Expiration, MetadataValue};
use bytes::{BufMut, Bytes, BytesMut};

/// Read a value starting at `offset`
#[derive(Debug, Clone)]
pub struct GetStreamOperation {
    key: Bytes,
    offset: u32,
}

impl GetStreamOperation {
    pub fn new(key: Bytes, offset: u32) -> Self {
        Self { key, offset }
    }
}

impl Operation for GetStreamOperation {
    type Output = Option<MetadataValue>;

    fn op_code(&self) -> OpCode {
        OpCode::GetStream
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_vint(buf, self.offset);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        if status.is_not_exist() {
            return Ok(None);
        }
        let metadata = read_entry_metadata(body)?;
        let value = read_array(body)?;
        Ok(Some(MetadataValue::from_parts(metadata, value)))
    }

    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

/// Condition attached to a streamed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCondition {
    Always,
    IfAbsent,
    IfVersion(u64),
}

impl StreamCondition {
    fn wire_version(self) -> u64 {
        match self {
            StreamCondition::Always => 0,
            StreamCondition::IfAbsent => u64::MAX,
            StreamCondition::IfVersion(version) => version,
        }
    }
}

/// Write a value as a sequence of length-prefixed chunks ending with an
/// empty chunk
#[derive(Debug, Clone)]
pub struct PutStreamOperation {
    key: Bytes,
    value: Bytes,
    condition: StreamCondition,
    expiration: Expiration,
    chunk_size: usize,
}

impl PutStreamOperation {
    pub fn new(
        key: Bytes,
        value: Bytes,
        condition: StreamCondition,
        expiration: Expiration,
        chunk_size: usize,
    ) -> Self {
        Self {
            key,
            value,
            condition,
            expiration,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Operation for PutStreamOperation {
    type Output = bool;

    fn op_code(&self) -> OpCode {
        OpCode::PutStream
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_expiration(buf, &self.expiration);
        buf.put_u64(self.condition.wire_version());
        for chunk in self.value.chunks(self.chunk_size) {
            write_array(buf, chunk);
        }
        write_vint(buf, 0);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<bool> {
        Ok(status.is_success())
    }
}
