//! Single-key reads and writes

use super::{DecodeContext, Operation, Routing, TopologyReaction};
use crate::codec::wire::{
    read_array, read_i64, read_u64, read_u8, read_vint, write_array, write_expiration, write_vint,
};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::{ClientError, Result};
use crate::types::{
    EntryMetadata, Expiration, MetadataValue, VersionedOperationResult, VersionedStatus,
    WriteResult,
};
use bytes::{BufMut, Bytes, BytesMut};

const INFINITE_LIFESPAN: u8 = 0x01;
const INFINITE_MAX_IDLE: u8 = 0x02;

/// Metadata block that precedes a value in metadata-bearing responses
pub(crate) fn read_entry_metadata(body: &mut Bytes) -> Result<EntryMetadata> {
    let flags = read_u8(body)?;
    let mut metadata = EntryMetadata::default();
    if flags & INFINITE_LIFESPAN == 0 {
        metadata.created = Some(read_i64(body)?);
        metadata.lifespan = Some(read_vint(body)?);
    }
    if flags & INFINITE_MAX_IDLE == 0 {
        metadata.last_used = Some(read_i64(body)?);
        metadata.max_idle = Some(read_vint(body)?);
    }
    metadata.version = read_u64(body)?;
    Ok(metadata)
}

pub(crate) fn write_entry_metadata(buf: &mut BytesMut, metadata: &EntryMetadata) {
    let mut flags = 0;
    if metadata.lifespan.is_none() {
        flags |= INFINITE_LIFESPAN;
    }
    if metadata.max_idle.is_none() {
        flags |= INFINITE_MAX_IDLE;
    }
    buf.put_u8(flags);
    if let (Some(created), Some(lifespan)) = (metadata.created, metadata.lifespan) {
        buf.put_i64(created);
        write_vint(buf, lifespan);
    }
    if let (Some(last_used), Some(max_idle)) = (metadata.last_used, metadata.max_idle) {
        buf.put_i64(last_used);
        write_vint(buf, max_idle);
    }
    buf.put_u64(metadata.version);
}

/// Previous value returned by a write, if the server sent one
fn read_previous(status: ResponseStatus, body: &mut Bytes) -> Result<Option<Bytes>> {
    if !status.has_previous() {
        return Ok(None);
    }
    let previous = read_array(body)?;
    Ok((!previous.is_empty()).then_some(previous))
}

fn unexpected(status: ResponseStatus, op: OpCode) -> ClientError {
    ClientError::Protocol(format!(
        "Unexpected status {:#04x} for {}",
        status.0,
        op.name()
    ))
}

#[derive(Debug, Clone)]
pub struct GetOperation {
    key: Bytes,
}

impl GetOperation {
    pub fn new(key: Bytes) -> Self {
        Self { key }
    }
}

impl Operation for GetOperation {
    type Output = Option<Bytes>;

    fn op_code(&self) -> OpCode {
        OpCode::Get
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
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
        Ok(Some(read_array(body)?))
    }

    // reads are safe to repeat on the new owner
    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

#[derive(Debug, Clone)]
pub struct GetWithMetadataOperation {
    key: Bytes,
}

impl GetWithMetadataOperation {
    pub fn new(key: Bytes) -> Self {
        Self { key }
    }
}

impl Operation for GetWithMetadataOperation {
    type Output = Option<MetadataValue>;

    fn op_code(&self) -> OpCode {
        OpCode::GetWithMetadata
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
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

#[derive(Debug, Clone)]
pub struct ContainsKeyOperation {
    key: Bytes,
}

impl ContainsKeyOperation {
    pub fn new(key: Bytes) -> Self {
        Self { key }
    }
}

impl Operation for ContainsKeyOperation {
    type Output = bool;

    fn op_code(&self) -> OpCode {
        OpCode::ContainsKey
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        Ok(!status.is_not_exist())
    }

    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

/// Unconditional write; yields the previous value when it was requested
#[derive(Debug, Clone)]
pub struct PutOperation {
    key: Bytes,
    value: Bytes,
    expiration: Expiration,
}

impl PutOperation {
    pub fn new(key: Bytes, value: Bytes, expiration: Expiration) -> Self {
        Self {
            key,
            value,
            expiration,
        }
    }
}

impl Operation for PutOperation {
    type Output = Option<Bytes>;

    fn op_code(&self) -> OpCode {
        OpCode::Put
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_expiration(buf, &self.expiration);
        write_array(buf, &self.value);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        read_previous(status, body)
    }
}

/// Write that only runs if the key is absent
#[derive(Debug, Clone)]
pub struct PutIfAbsentOperation {
    key: Bytes,
    value: Bytes,
    expiration: Expiration,
}

impl PutIfAbsentOperation {
    pub fn new(key: Bytes, value: Bytes, expiration: Expiration) -> Self {
        Self {
            key,
            value,
            expiration,
        }
    }
}

impl Operation for PutIfAbsentOperation {
    type Output = WriteResult;

    fn op_code(&self) -> OpCode {
        OpCode::PutIfAbsent
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_expiration(buf, &self.expiration);
        write_array(buf, &self.value);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        Ok(WriteResult {
            executed: status.is_success(),
            previous: read_previous(status, body)?,
        })
    }
}

/// Write that only runs if the key is present
#[derive(Debug, Clone)]
pub struct ReplaceOperation {
    key: Bytes,
    value: Bytes,
    expiration: Expiration,
}

impl ReplaceOperation {
    pub fn new(key: Bytes, value: Bytes, expiration: Expiration) -> Self {
        Self {
            key,
            value,
            expiration,
        }
    }
}

impl Operation for ReplaceOperation {
    type Output = WriteResult;

    fn op_code(&self) -> OpCode {
        OpCode::Replace
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_expiration(buf, &self.expiration);
        write_array(buf, &self.value);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        Ok(WriteResult {
            executed: status.is_success(),
            previous: read_previous(status, body)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RemoveOperation {
    key: Bytes,
}

impl RemoveOperation {
    pub fn new(key: Bytes) -> Self {
        Self { key }
    }
}

impl Operation for RemoveOperation {
    type Output = WriteResult;

    fn op_code(&self) -> OpCode {
        OpCode::Remove
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        Ok(WriteResult {
            executed: status.is_success(),
            previous: read_previous(status, body)?,
        })
    }
}

fn versioned_result(
    op: OpCode,
    status: ResponseStatus,
    body: &mut Bytes,
) -> Result<VersionedOperationResult> {
    let outcome = if status.is_success() {
        VersionedStatus::Success
    } else if status.is_not_exist() {
        VersionedStatus::NoSuchKey
    } else if status.is_not_executed() {
        VersionedStatus::ModifiedKey
    } else {
        return Err(unexpected(status, op));
    };
    Ok(VersionedOperationResult {
        status: outcome,
        previous: read_previous(status, body)?,
    })
}

/// Replace only if the entry still has `version`
#[derive(Debug, Clone)]
pub struct ReplaceIfUnmodifiedOperation {
    key: Bytes,
    value: Bytes,
    version: u64,
    expiration: Expiration,
}

impl ReplaceIfUnmodifiedOperation {
    pub fn new(key: Bytes, value: Bytes, version: u64, expiration: Expiration) -> Self {
        Self {
            key,
            value,
            version,
            expiration,
        }
    }
}

impl Operation for ReplaceIfUnmodifiedOperation {
    type Output = VersionedOperationResult;

    fn op_code(&self) -> OpCode {
        OpCode::ReplaceIfUnmodified
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        write_expiration(buf, &self.expiration);
        buf.put_u64(self.version);
        write_array(buf, &self.value);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        versioned_result(self.op_code(), status, body)
    }
}

/// Remove only if the entry still has `version`
#[derive(Debug, Clone)]
pub struct RemoveIfUnmodifiedOperation {
    key: Bytes,
    version: u64,
}

impl RemoveIfUnmodifiedOperation {
    pub fn new(key: Bytes, version: u64) -> Self {
        Self { key, version }
    }
}

impl Operation for RemoveIfUnmodifiedOperation {
    type Output = VersionedOperationResult;

    fn op_code(&self) -> OpCode {
        OpCode::RemoveIfUnmodified
    }

    fn routing(&self) -> Routing {
        Routing::Key(self.key.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        buf.put_u64(self.version);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Self::Output> {
        versioned_result(self.op_code(), status, body)
    }
}
