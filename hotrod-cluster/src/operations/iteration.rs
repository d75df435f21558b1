//! Server-side iteration protocol: start a cursor, pull pages, end it

use super::key::{read_entry_metadata, write_entry_metadata};
use super::listener::FactoryRef;
use super::{DecodeContext, Operation, Routing, TopologyReaction};
use crate::codec::wire::{
    bitset_to_segments, read_array, read_string, read_u8, read_vint, segments_to_bitset,
    write_array, write_optional_array, write_string, write_vint,
};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::{ClientError, Result};
use crate::types::{EntryMetadata, NodeAddress};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

/// One entry delivered by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub metadata: Option<EntryMetadata>,
    /// Every projected value when the filter produced more than one;
    /// `value` then holds the first
    pub projections: Vec<Bytes>,
}

impl ScanEntry {
    pub fn new(key: Bytes, value: Bytes, metadata: Option<EntryMetadata>) -> Self {
        Self {
            key,
            value,
            metadata,
            projections: Vec::new(),
        }
    }
}

/// A server cursor and the node holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationCursor {
    pub iteration_id: String,
    pub address: NodeAddress,
}

/// One page of a server iteration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IterationPage {
    /// Segments the server has fully delivered
    pub finished_segments: Vec<u32>,
    pub entries: Vec<ScanEntry>,
}

impl IterationPage {
    pub fn is_last(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IterationStartOperation {
    segments: Option<BTreeSet<u32>>,
    filter: Option<FactoryRef>,
    batch_size: u32,
    metadata: bool,
    target: Option<NodeAddress>,
}

impl IterationStartOperation {
    pub fn new(
        segments: Option<BTreeSet<u32>>,
        filter: Option<FactoryRef>,
        batch_size: u32,
        metadata: bool,
        target: Option<NodeAddress>,
    ) -> Self {
        Self {
            segments,
            filter,
            batch_size,
            metadata,
            target,
        }
    }
}

impl Operation for IterationStartOperation {
    type Output = IterationCursor;

    fn op_code(&self) -> OpCode {
        OpCode::IterationStart
    }

    fn routing(&self) -> Routing {
        match &self.target {
            Some(address) => Routing::Address(address.clone()),
            None => Routing::Any,
        }
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        let bitset = self
            .segments
            .as_ref()
            .map(|segments| segments_to_bitset(segments.iter().copied()));
        write_optional_array(buf, bitset.as_deref());
        match &self.filter {
            Some(filter) => {
                write_optional_array(buf, Some(filter.name.as_bytes()));
                buf.put_u8(filter.params.len() as u8);
                for param in &filter.params {
                    write_array(buf, param);
                }
            }
            None => write_optional_array(buf, None),
        }
        write_vint(buf, self.batch_size);
        buf.put_u8(self.metadata as u8);
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<IterationCursor> {
        Ok(IterationCursor {
            iteration_id: read_string(body)?,
            address: ctx.address.clone(),
        })
    }
}

/// Pulls the next page; each entry says itself whether metadata follows
#[derive(Debug, Clone)]
pub struct IterationNextOperation {
    cursor: IterationCursor,
}

impl IterationNextOperation {
    pub fn new(cursor: IterationCursor) -> Self {
        Self { cursor }
    }
}

/// Page body: finished-segment bitset, entry count, then (only with
/// entries) the projection count, then per entry a metadata-present byte,
/// the optional metadata, the key and one array per projection
pub(crate) fn write_page(buf: &mut BytesMut, page: &IterationPage) {
    write_array(buf, &segments_to_bitset(page.finished_segments.iter().copied()));
    write_vint(buf, page.entries.len() as u32);
    if page.entries.is_empty() {
        return;
    }
    let projections = page
        .entries
        .iter()
        .map(|entry| entry.projections.len())
        .max()
        .unwrap_or(0)
        .max(1);
    write_vint(buf, projections as u32);
    for entry in &page.entries {
        match &entry.metadata {
            Some(metadata) => {
                buf.put_u8(1);
                write_entry_metadata(buf, metadata);
            }
            None => buf.put_u8(0),
        }
        write_array(buf, &entry.key);
        if projections > 1 {
            for projection in &entry.projections {
                write_array(buf, projection);
            }
        } else {
            write_array(buf, &entry.value);
        }
    }
}

impl Operation for IterationNextOperation {
    type Output = IterationPage;

    fn op_code(&self) -> OpCode {
        OpCode::IterationNext
    }

    fn routing(&self) -> Routing {
        Routing::Address(self.cursor.address.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_string(buf, &self.cursor.iteration_id);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<IterationPage> {
        if status.is_invalid_iteration() {
            return Err(ClientError::InvalidIteration(
                self.cursor.iteration_id.clone(),
            ));
        }
        let finished_segments = bitset_to_segments(&read_array(body)?);
        let count = read_vint(body)?;
        let projections = if count > 0 { read_vint(body)? } else { 0 };
        let mut entries = Vec::with_capacity(count.min(65_536) as usize);
        for _ in 0..count {
            let metadata = match read_u8(body)? {
                1 => Some(read_entry_metadata(body)?),
                _ => None,
            };
            let key = read_array(body)?;
            if projections > 1 {
                let values = (0..projections)
                    .map(|_| read_array(body))
                    .collect::<Result<Vec<_>>>()?;
                entries.push(ScanEntry {
                    key,
                    value: values[0].clone(),
                    metadata,
                    projections: values,
                });
            } else {
                entries.push(ScanEntry::new(key, read_array(body)?, metadata));
            }
        }
        Ok(IterationPage {
            finished_segments,
            entries,
        })
    }

    // the scan layer regroups segments against the new owners
    fn on_topology_changed(&self) -> TopologyReaction {
        TopologyReaction::Retry
    }
}

#[derive(Debug, Clone)]
pub struct IterationEndOperation {
    cursor: IterationCursor,
}

impl IterationEndOperation {
    pub fn new(cursor: IterationCursor) -> Self {
        Self { cursor }
    }
}

impl Operation for IterationEndOperation {
    /// Whether the server still knew the cursor
    type Output = bool;

    fn op_code(&self) -> OpCode {
        OpCode::IterationEnd
    }

    fn routing(&self) -> Routing {
        Routing::Address(self.cursor.address.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_string(buf, &self.cursor.iteration_id);
    }

    fn decode(
        &self,
        status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<bool> {
        Ok(!status.is_invalid_iteration())
    }
}
