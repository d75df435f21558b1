//! Request and response headers, including the topology payload
//!
//! ```text
//! request:  magic | message id | version | opcode | cache name | flags
//!           | intelligence | topology id [| key type | value type]
//! response: magic | message id | opcode | status | topology marker
//!           [| topology payload]
//! ```

use super::wire::{
    read_array, read_string, read_u16, read_u8, read_vint, read_vlong, write_array, write_string,
    write_vint, write_vlong,
};
use super::{ProtocolVersion, ResponseStatus, HASH_FUNCTION_MURMUR3, REQUEST_MAGIC, RESPONSE_MAGIC};
use crate::error::{ClientError, Result};
use crate::types::{ClientIntelligence, Flags, NodeAddress};
use bytes::{BufMut, Bytes, BytesMut};

/// Header fields of an outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub message_id: u64,
    pub version: ProtocolVersion,
    pub op_code: u8,
    pub cache_name: Bytes,
    pub flags: Flags,
    pub intelligence: ClientIntelligence,
    pub topology_id: i32,
}

pub fn write_request_header(buf: &mut BytesMut, header: &RequestHeader) {
    buf.put_u8(REQUEST_MAGIC);
    write_vlong(buf, header.message_id);
    buf.put_u8(header.version.code());
    buf.put_u8(header.op_code);
    write_array(buf, &header.cache_name);
    write_vint(buf, header.flags.bits());
    buf.put_u8(header.intelligence.code());
    write_vint(buf, header.topology_id as u32);
    if header.version.has_media_types() {
        // no explicit key/value media type
        buf.put_u8(0);
        buf.put_u8(0);
    }
}

/// Decode a request header, as a server or proxy sees it
pub fn read_request_header(buf: &mut Bytes) -> Result<RequestHeader> {
    let magic = read_u8(buf)?;
    if magic != REQUEST_MAGIC {
        return Err(ClientError::Protocol(format!(
            "Invalid request magic {:#04x}",
            magic
        )));
    }
    let message_id = read_vlong(buf)?;
    let version_code = read_u8(buf)?;
    let version =
        ProtocolVersion::from_code(version_code).ok_or(ClientError::UnsupportedVersion(version_code))?;
    let op_code = read_u8(buf)?;
    let cache_name = read_array(buf)?;
    let flags = Flags::from_bits(read_vint(buf)?);
    let intelligence_code = read_u8(buf)?;
    let intelligence = ClientIntelligence::from_code(intelligence_code).ok_or_else(|| {
        ClientError::Protocol(format!("Unknown client intelligence {}", intelligence_code))
    })?;
    let topology_id = read_vint(buf)? as i32;
    if version.has_media_types() {
        read_u8(buf)?;
        read_u8(buf)?;
    }
    Ok(RequestHeader {
        message_id,
        version,
        op_code,
        cache_name,
        flags,
        intelligence,
        topology_id,
    })
}

/// Topology carried by a response or a server push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    pub topology_id: i32,
    pub servers: Vec<NodeAddress>,
    /// Zero when the cache has no segment data
    pub hash_function: u8,
    /// Per segment, indices into `servers` (primary first)
    pub segment_owners: Option<Vec<Vec<u32>>>,
}

pub fn write_topology_update(
    buf: &mut BytesMut,
    update: &TopologyUpdate,
    intelligence: ClientIntelligence,
) {
    write_vint(buf, update.topology_id as u32);
    write_vint(buf, update.servers.len() as u32);
    for server in &update.servers {
        write_string(buf, &server.host);
        buf.put_u16(server.port);
    }
    if intelligence != ClientIntelligence::HashDistributionAware {
        return;
    }
    match &update.segment_owners {
        Some(segments) if update.hash_function != 0 => {
            buf.put_u8(update.hash_function);
            write_vint(buf, segments.len() as u32);
            for owners in segments {
                buf.put_u8(owners.len() as u8);
                for owner in owners {
                    write_vint(buf, *owner);
                }
            }
        }
        _ => buf.put_u8(0),
    }
}

pub fn read_topology_update(
    buf: &mut Bytes,
    intelligence: ClientIntelligence,
) -> Result<TopologyUpdate> {
    let topology_id = read_vint(buf)? as i32;
    let server_count = read_vint(buf)? as usize;
    let mut servers = Vec::with_capacity(server_count.min(1024));
    for _ in 0..server_count {
        let host = read_string(buf)?;
        let port = read_u16(buf)?;
        servers.push(NodeAddress::new(host, port));
    }

    if intelligence != ClientIntelligence::HashDistributionAware {
        return Ok(TopologyUpdate {
            topology_id,
            servers,
            hash_function: 0,
            segment_owners: None,
        });
    }

    let hash_function = read_u8(buf)?;
    if hash_function == 0 {
        return Ok(TopologyUpdate {
            topology_id,
            servers,
            hash_function,
            segment_owners: None,
        });
    }

    let segment_count = read_vint(buf)? as usize;
    let mut segment_owners = Vec::with_capacity(segment_count.min(65536));
    for segment in 0..segment_count {
        let owner_count = read_u8(buf)?;
        let mut owners = Vec::with_capacity(owner_count as usize);
        for _ in 0..owner_count {
            let index = read_vint(buf)?;
            if index as usize >= servers.len() {
                return Err(ClientError::Protocol(format!(
                    "Segment {} references unknown server index {}",
                    segment, index
                )));
            }
            owners.push(index);
        }
        segment_owners.push(owners);
    }

    Ok(TopologyUpdate {
        topology_id,
        servers,
        hash_function,
        segment_owners: Some(segment_owners),
    })
}

/// Decoded response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub message_id: u64,
    pub op_code: u8,
    pub status: ResponseStatus,
    pub topology: Option<TopologyUpdate>,
}

/// Decode a response header; the topology payload, when flagged, is
/// consumed so `buf` is left at the start of the body.
pub fn read_response_header(
    buf: &mut Bytes,
    intelligence: ClientIntelligence,
) -> Result<ResponseHeader> {
    let magic = read_u8(buf)?;
    if magic != RESPONSE_MAGIC {
        return Err(ClientError::Protocol(format!(
            "Invalid response magic {:#04x}",
            magic
        )));
    }
    let message_id = read_vlong(buf)?;
    let op_code = read_u8(buf)?;
    let status = ResponseStatus(read_u8(buf)?);
    let topology = match read_u8(buf)? {
        0 => None,
        1 => Some(read_topology_update(buf, intelligence)?),
        other => {
            return Err(ClientError::Protocol(format!(
                "Invalid topology change marker {}",
                other
            )))
        }
    };
    Ok(ResponseHeader {
        message_id,
        op_code,
        status,
        topology,
    })
}

pub fn write_response_header(
    buf: &mut BytesMut,
    header: &ResponseHeader,
    intelligence: ClientIntelligence,
) {
    buf.put_u8(RESPONSE_MAGIC);
    write_vlong(buf, header.message_id);
    buf.put_u8(header.op_code);
    buf.put_u8(header.status.0);
    match &header.topology {
        Some(update) => {
            buf.put_u8(1);
            write_topology_update(buf, update, intelligence);
        }
        None => buf.put_u8(0),
    }
}

impl TopologyUpdate {
    /// Build a MurmurHash3 topology from owner addresses per segment
    pub fn from_owners(topology_id: i32, owners: &[Vec<NodeAddress>]) -> Self {
        let mut servers: Vec<NodeAddress> = Vec::new();
        let segment_owners = owners
            .iter()
            .map(|segment| {
                segment
                    .iter()
                    .map(|addr| match servers.iter().position(|s| s == addr) {
                        Some(i) => i as u32,
                        None => {
                            servers.push(addr.clone());
                            (servers.len() - 1) as u32
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            topology_id,
            servers,
            hash_function: HASH_FUNCTION_MURMUR3,
            segment_owners: Some(segment_owners),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> NodeAddress {
        NodeAddress::new(name, 11222)
    }

    #[test]
    fn test_request_header_layout() {
        let header = RequestHeader {
            message_id: 7,
            version: ProtocolVersion::V28,
            op_code: 0x03,
            cache_name: Bytes::from_static(b"users"),
            flags: Flags::FORCE_RETURN_VALUE,
            intelligence: ClientIntelligence::HashDistributionAware,
            topology_id: 4,
        };
        let mut buf = BytesMut::new();
        write_request_header(&mut buf, &header);
        assert_eq!(
            &buf[..],
            &[0xA0, 7, 28, 0x03, 5, b'u', b's', b'e', b'r', b's', 0x01, 0x03, 4, 0, 0]
        );

        let decoded = read_request_header(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_request_header_without_media_types() {
        let header = RequestHeader {
            message_id: 1,
            version: ProtocolVersion::V25,
            op_code: 0x17,
            cache_name: Bytes::new(),
            flags: Flags::NONE,
            intelligence: ClientIntelligence::Basic,
            topology_id: 0,
        };
        let mut buf = BytesMut::new();
        write_request_header(&mut buf, &header);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_response_without_topology_change() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xA1, 9, 0x04, 0x00, 0x00]);
        buf.put_slice(b"body");
        let mut bytes = buf.freeze();

        let header =
            read_response_header(&mut bytes, ClientIntelligence::HashDistributionAware).unwrap();
        assert_eq!(header.message_id, 9);
        assert_eq!(header.status, ResponseStatus::NO_ERROR);
        assert!(header.topology.is_none());
        assert_eq!(&bytes[..], b"body");
    }

    #[test]
    fn test_topology_payload_follows_status() {
        let update = TopologyUpdate::from_owners(
            12,
            &[vec![addr("a"), addr("b")], vec![addr("b"), addr("c")]],
        );
        let header = ResponseHeader {
            message_id: 3,
            op_code: 0x04,
            status: ResponseStatus::NO_ERROR,
            topology: Some(update.clone()),
        };
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, &header, ClientIntelligence::HashDistributionAware);
        buf.put_slice(b"rest");

        // marker sits right after the status byte
        assert_eq!(buf[3], 0x00);
        assert_eq!(buf[4], 0x01);

        let mut bytes = buf.freeze();
        let decoded =
            read_response_header(&mut bytes, ClientIntelligence::HashDistributionAware).unwrap();
        assert_eq!(decoded.topology, Some(update));
        assert_eq!(&bytes[..], b"rest");
    }

    #[test]
    fn test_topology_aware_payload_has_no_segments() {
        let update = TopologyUpdate::from_owners(2, &[vec![addr("a")]]);
        let mut buf = BytesMut::new();
        write_topology_update(&mut buf, &update, ClientIntelligence::TopologyAware);
        let decoded =
            read_topology_update(&mut buf.freeze(), ClientIntelligence::TopologyAware).unwrap();
        assert_eq!(decoded.servers, vec![addr("a")]);
        assert!(decoded.segment_owners.is_none());
    }

    #[test]
    fn test_unknown_owner_index_rejected() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, 1);
        write_vint(&mut buf, 1);
        write_string(&mut buf, "a");
        buf.put_u16(11222);
        buf.put_u8(HASH_FUNCTION_MURMUR3);
        write_vint(&mut buf, 1);
        buf.put_u8(1);
        write_vint(&mut buf, 5);
        let err = read_topology_update(&mut buf.freeze(), ClientIntelligence::HashDistributionAware)
            .unwrap_err();
        assert_eq!(err.error_type(), "protocol");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Bytes::from_static(&[0xA0, 1, 4, 0, 0]);
        assert!(read_response_header(&mut bytes, ClientIntelligence::Basic).is_err());
    }
}
