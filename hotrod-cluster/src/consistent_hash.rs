//! Segment-based consistent hash
//!
//! Maps a key to a segment with [`crate::hash::segment_of`] and a segment to
//! its ordered owner list (primary first). A map is built once per topology
//! and never modified afterwards.

use crate::error::{ClientError, Result};
use crate::hash;
use crate::types::NodeAddress;
use std::collections::{BTreeSet, HashMap};

/// Immutable segment to owners table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMap {
    owners: Vec<Vec<NodeAddress>>,
}

impl SegmentMap {
    /// Build a map from owners per segment
    pub fn new(owners: Vec<Vec<NodeAddress>>) -> Result<Self> {
        if owners.is_empty() {
            return Err(ClientError::Protocol(
                "Segment map must have at least one segment".into(),
            ));
        }
        Ok(Self { owners })
    }

    /// Build a map from server indices per segment
    pub fn from_indices(servers: &[NodeAddress], segment_owners: &[Vec<u32>]) -> Result<Self> {
        let owners = segment_owners
            .iter()
            .map(|indices| {
                indices
                    .iter()
                    .map(|i| {
                        servers.get(*i as usize).cloned().ok_or_else(|| {
                            ClientError::Protocol(format!("Unknown server index {}", i))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(owners)
    }

    pub fn segment_count(&self) -> u32 {
        self.owners.len() as u32
    }

    pub fn segment_of(&self, key: &[u8]) -> u32 {
        hash::segment_of(key, self.segment_count())
    }

    /// Ordered owners of `key`; empty if its segment has no owner
    pub fn owners_of(&self, key: &[u8]) -> &[NodeAddress] {
        self.owners_of_segment(self.segment_of(key))
    }

    pub fn owners_of_segment(&self, segment: u32) -> &[NodeAddress] {
        self.owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary_of(&self, key: &[u8]) -> Option<&NodeAddress> {
        self.owners_of(key).first()
    }

    pub fn primary_of_segment(&self, segment: u32) -> Option<&NodeAddress> {
        self.owners_of_segment(segment).first()
    }

    /// For each address, the segments it owns as primary
    pub fn primary_segments_by_address(&self) -> HashMap<NodeAddress, BTreeSet<u32>> {
        let mut by_address: HashMap<NodeAddress, BTreeSet<u32>> = HashMap::new();
        for (segment, owners) in self.owners.iter().enumerate() {
            if let Some(primary) = owners.first() {
                by_address
                    .entry(primary.clone())
                    .or_default()
                    .insert(segment as u32);
            }
        }
        by_address
    }
}
