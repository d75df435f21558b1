//! In-memory cluster used by unit tests
//!
//! [`FakeCluster`] plays both sides of the wire: it is the
//! [`ChannelProvider`] operations acquire channels from, and the server
//! those channels talk to. Requests are decoded with the real codec, run
//! against a shared key/value map, and answered with real response frames,
//! including a topology payload whenever the request carried a stale id.

use crate::codec::header::{read_request_header, write_response_header};
use crate::codec::wire::{
    bitset_to_segments, read_array, read_expiration, read_optional_array, read_string, read_u64,
    read_u8, read_vint, write_array, write_string, write_vint, write_vlong,
};
use crate::codec::{
    OpCode, ProtocolVersion, ResponseHeader, ResponseStatus, TopologyUpdate, ERROR_RESPONSE,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::factory::OperationsFactory;
use crate::hash;
use crate::operations::iteration::{write_page, IterationPage, ScanEntry};
use crate::topology::TopologyRegistry;
use crate::transport::{Channel, ChannelProvider, ChannelTarget};
use crate::types::{ClientIntelligence, EntryMetadata, Flags, NodeAddress};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) fn addr(name: &str) -> NodeAddress {
    NodeAddress::new(name, 11222)
}

/// `per_segment` keys for each of `segments` segments, ordered by segment
pub(crate) fn keys_covering_segments(segments: usize, per_segment: usize) -> Vec<Bytes> {
    let mut buckets: Vec<Vec<Bytes>> = vec![Vec::new(); segments];
    let mut i = 0u64;
    while buckets.iter().any(|b| b.len() < per_segment) {
        let key = Bytes::from(format!("key-{}", i));
        i += 1;
        let segment = hash::segment_of(&key, segments as u32) as usize;
        if buckets[segment].len() < per_segment {
            buckets[segment].push(key);
        }
    }
    buckets.into_iter().flatten().collect()
}

/// A request as the fake server saw it
#[derive(Debug, Clone)]
pub(crate) struct RequestRecord {
    pub address: NodeAddress,
    pub op_code: Option<OpCode>,
    pub topology_id: i32,
    pub flags: Flags,
}

struct Iteration {
    entries: VecDeque<(u32, Bytes, Bytes, u64)>,
    pending_segments: BTreeSet<u32>,
    batch_size: usize,
    metadata: bool,
}

struct Stored {
    value: Bytes,
    version: u64,
}

struct ClusterState {
    epoch: i32,
    owners: Vec<Vec<NodeAddress>>,
    version: ProtocolVersion,
    data: BTreeMap<Bytes, Stored>,
    next_version: u64,
    requests: Vec<RequestRecord>,
    failures: HashMap<NodeAddress, (u8, usize)>,
    delays: HashMap<NodeAddress, Duration>,
    down: HashSet<NodeAddress>,
    withheld_topology: HashSet<NodeAddress>,
    iterations: HashMap<String, Iteration>,
    next_iteration: u64,
    next_channel: u64,
    acquired: Vec<u64>,
    released: Vec<u64>,
    discarded: Vec<u64>,
}

impl ClusterState {
    fn servers(&self) -> BTreeSet<NodeAddress> {
        self.owners.iter().flatten().cloned().collect()
    }

    fn segment_count(&self) -> u32 {
        self.owners.len().max(1) as u32
    }

    fn topology_update(&self) -> TopologyUpdate {
        TopologyUpdate::from_owners(self.epoch, &self.owners)
    }

    fn store(&mut self, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.next_version += 1;
        let version = self.next_version;
        self.data
            .insert(key, Stored { value, version })
            .map(|previous| previous.value)
    }
}

/// Shared handle to the fake cluster
#[derive(Clone)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// Cluster at topology epoch 1 with `owners[segment]` owning each segment
    pub(crate) fn new(owners: Vec<Vec<NodeAddress>>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                epoch: 1,
                owners,
                version: ProtocolVersion::V31,
                data: BTreeMap::new(),
                next_version: 0,
                requests: Vec::new(),
                failures: HashMap::new(),
                delays: HashMap::new(),
                down: HashSet::new(),
                withheld_topology: HashSet::new(),
                iterations: HashMap::new(),
                next_iteration: 0,
                next_channel: 0,
                acquired: Vec::new(),
                released: Vec::new(),
                discarded: Vec::new(),
            })),
        }
    }

    pub(crate) fn factory(&self, cache_name: &str) -> OperationsFactory {
        self.factory_with_config(cache_name, ClientConfig::default())
    }

    /// Factory whose registry already knows the current topology of
    /// `cache_name`
    pub(crate) fn factory_with_config(
        &self,
        cache_name: &str,
        mut config: ClientConfig,
    ) -> OperationsFactory {
        let (servers, update) = {
            let state = self.state.lock();
            (state.servers(), state.topology_update())
        };
        config.servers = servers.iter().map(|s| s.to_string()).collect();
        let registry = Arc::new(TopologyRegistry::new(
            config.client_intelligence,
            servers.into_iter().collect(),
        ));
        registry
            .apply_update(cache_name.as_bytes(), update)
            .expect("seed topology");
        OperationsFactory::new(
            cache_name,
            Arc::new(self.clone()),
            registry,
            Arc::new(config),
        )
    }

    /// Move segments to new owners; bumps the epoch
    pub(crate) fn set_owners(&self, owners: Vec<Vec<NodeAddress>>) {
        let mut state = self.state.lock();
        state.owners = owners;
        state.epoch += 1;
    }

    pub(crate) fn set_protocol_version(&self, version: ProtocolVersion) {
        self.state.lock().version = version;
    }

    pub(crate) fn insert(&self, key: Bytes, value: Bytes) {
        self.state.lock().store(key, value);
    }

    pub(crate) fn stored(&self, key: &[u8]) -> Option<Bytes> {
        self.state.lock().data.get(key).map(|s| s.value.clone())
    }

    /// Answer the next `count` requests reaching `address` with `status`
    pub(crate) fn fail_requests_at(&self, address: &NodeAddress, status: u8, count: usize) {
        self.state
            .lock()
            .failures
            .insert(address.clone(), (status, count));
    }

    /// Hold every response from `address` back for `delay`
    pub(crate) fn delay_responses(&self, address: &NodeAddress, delay: Duration) {
        self.state.lock().delays.insert(address.clone(), delay);
    }

    /// Refuse connections to `address` and reset channels already open to it
    pub(crate) fn set_down(&self, address: &NodeAddress) {
        self.state.lock().down.insert(address.clone());
    }

    /// Answer stale requests at `address` without a topology payload, as a
    /// node that has not seen the new topology yet would
    pub(crate) fn withhold_topology_at(&self, address: &NodeAddress) {
        self.state.lock().withheld_topology.insert(address.clone());
    }

    pub(crate) fn version_of(&self, key: &[u8]) -> Option<u64> {
        self.state.lock().data.get(key).map(|s| s.version)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub(crate) fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn requests_for(&self, op_code: OpCode) -> Vec<RequestRecord> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.op_code == Some(op_code))
            .cloned()
            .collect()
    }

    pub(crate) fn acquired_total(&self) -> usize {
        self.state.lock().acquired.len()
    }

    pub(crate) fn released_total(&self) -> usize {
        self.state.lock().released.len()
    }

    pub(crate) fn discarded_total(&self) -> usize {
        self.state.lock().discarded.len()
    }

    pub(crate) fn open_iterations(&self) -> usize {
        self.state.lock().iterations.len()
    }

    /// Every acquired channel went back exactly once, released or discarded
    pub(crate) fn assert_all_channels_returned_once(&self) {
        let state = self.state.lock();
        let mut returned: HashMap<u64, usize> = HashMap::new();
        for id in state.released.iter().chain(state.discarded.iter()) {
            *returned.entry(*id).or_default() += 1;
        }
        for id in &state.acquired {
            assert_eq!(
                returned.get(id).copied().unwrap_or(0),
                1,
                "channel {} returned {} times",
                id,
                returned.get(id).copied().unwrap_or(0)
            );
        }
        assert_eq!(returned.len(), state.acquired.len());
    }

    fn is_down(&self, address: &NodeAddress) -> bool {
        self.state.lock().down.contains(address)
    }

    /// Run one request frame and build its response
    fn serve(&self, address: &NodeAddress, mut frame: Bytes) -> (Bytes, Duration) {
        let mut state = self.state.lock();
        let delay = state.delays.get(address).copied().unwrap_or_default();
        let header = match read_request_header(&mut frame) {
            Ok(header) => header,
            Err(e) => {
                let response = error_frame(
                    0,
                    ResponseStatus::REQUEST_PARSING_ERROR,
                    None,
                    ClientIntelligence::Basic,
                    &e.to_string(),
                );
                return (response, delay);
            }
        };
        let op_code = OpCode::from_code(header.op_code);
        state.requests.push(RequestRecord {
            address: address.clone(),
            op_code,
            topology_id: header.topology_id,
            flags: header.flags,
        });

        let topology = (header.intelligence != ClientIntelligence::Basic
            && header.topology_id < state.epoch
            && !state.withheld_topology.contains(address))
            .then(|| state.topology_update());

        if let Some((status, remaining)) = state.failures.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                let status = ResponseStatus(*status);
                let response = error_frame(
                    header.message_id,
                    status,
                    topology,
                    header.intelligence,
                    "injected failure",
                );
                return (response, delay);
            }
        }

        let result = match op_code {
            Some(op) => execute(&mut state, address, op, header.flags, &mut frame),
            None => Err(ClientError::Protocol(format!(
                "Unknown opcode {:#04x}",
                header.op_code
            ))),
        };
        let response = match result {
            Ok((status, body)) => {
                let mut buf = BytesMut::new();
                write_response_header(
                    &mut buf,
                    &ResponseHeader {
                        message_id: header.message_id,
                        op_code: header.op_code + 1,
                        status,
                        topology,
                    },
                    header.intelligence,
                );
                buf.extend_from_slice(&body);
                buf.freeze()
            }
            Err(e) => error_frame(
                header.message_id,
                ResponseStatus::UNKNOWN_COMMAND,
                topology,
                header.intelligence,
                &e.to_string(),
            ),
        };
        (response, delay)
    }
}

fn error_frame(
    message_id: u64,
    status: ResponseStatus,
    topology: Option<TopologyUpdate>,
    intelligence: ClientIntelligence,
    message: &str,
) -> Bytes {
    let mut buf = BytesMut::new();
    write_response_header(
        &mut buf,
        &ResponseHeader {
            message_id,
            op_code: ERROR_RESPONSE,
            status,
            topology,
        },
        intelligence,
    );
    write_string(&mut buf, message);
    buf.freeze()
}

fn execute(
    state: &mut ClusterState,
    address: &NodeAddress,
    op: OpCode,
    flags: Flags,
    body: &mut Bytes,
) -> Result<(ResponseStatus, BytesMut)> {
    let force_return = flags.contains(Flags::FORCE_RETURN_VALUE);
    let mut out = BytesMut::new();
    let status = match op {
        OpCode::Get => {
            let key = read_array(body)?;
            match state.data.get(&key) {
                Some(stored) => {
                    write_array(&mut out, &stored.value);
                    ResponseStatus::NO_ERROR
                }
                None => ResponseStatus::KEY_DOES_NOT_EXIST,
            }
        }
        OpCode::ContainsKey => {
            let key = read_array(body)?;
            if state.data.contains_key(&key) {
                ResponseStatus::NO_ERROR
            } else {
                ResponseStatus::KEY_DOES_NOT_EXIST
            }
        }
        OpCode::Put => {
            let key = read_array(body)?;
            read_expiration(body)?;
            let value = read_array(body)?;
            match state.store(key, value) {
                Some(previous) if force_return => {
                    write_array(&mut out, &previous);
                    ResponseStatus::SUCCESS_WITH_PREVIOUS
                }
                _ => ResponseStatus::NO_ERROR,
            }
        }
        OpCode::PutIfAbsent => {
            let key = read_array(body)?;
            read_expiration(body)?;
            let value = read_array(body)?;
            match state.data.get(&key) {
                Some(existing) if force_return => {
                    write_array(&mut out, &existing.value);
                    ResponseStatus::NOT_EXECUTED_WITH_PREVIOUS
                }
                Some(_) => ResponseStatus::NOT_PUT_REMOVED_REPLACED,
                None => {
                    state.store(key, value);
                    ResponseStatus::NO_ERROR
                }
            }
        }
        OpCode::ReplaceIfUnmodified => {
            let key = read_array(body)?;
            read_expiration(body)?;
            let expected = read_u64(body)?;
            let value = read_array(body)?;
            match state.data.get(&key).map(|s| s.version) {
                None => ResponseStatus::KEY_DOES_NOT_EXIST,
                Some(version) if version != expected => ResponseStatus::NOT_PUT_REMOVED_REPLACED,
                Some(_) => {
                    state.store(key, value);
                    ResponseStatus::NO_ERROR
                }
            }
        }
        OpCode::Remove => {
            let key = read_array(body)?;
            match state.data.remove(&key) {
                Some(previous) if force_return => {
                    write_array(&mut out, &previous.value);
                    ResponseStatus::SUCCESS_WITH_PREVIOUS
                }
                Some(_) => ResponseStatus::NO_ERROR,
                None => ResponseStatus::KEY_DOES_NOT_EXIST,
            }
        }
        OpCode::GetAll => {
            let count = read_vint(body)?;
            let mut found = Vec::new();
            for _ in 0..count {
                let key = read_array(body)?;
                if let Some(stored) = state.data.get(&key) {
                    found.push((key, stored.value.clone()));
                }
            }
            write_vint(&mut out, found.len() as u32);
            for (key, value) in found {
                write_array(&mut out, &key);
                write_array(&mut out, &value);
            }
            ResponseStatus::NO_ERROR
        }
        OpCode::PutAll => {
            read_expiration(body)?;
            let count = read_vint(body)?;
            for _ in 0..count {
                let key = read_array(body)?;
                let value = read_array(body)?;
                state.store(key, value);
            }
            ResponseStatus::NO_ERROR
        }
        OpCode::Size => {
            write_vlong(&mut out, state.data.len() as u64);
            ResponseStatus::NO_ERROR
        }
        OpCode::Clear => {
            state.data.clear();
            ResponseStatus::NO_ERROR
        }
        OpCode::Ping => {
            if state.version.has_ping_capabilities() {
                out.put_u8(0);
                out.put_u8(0);
                out.put_u8(state.version.code());
                write_vint(&mut out, 2);
                out.put_u16(OpCode::Get.code() as u16);
                out.put_u16(OpCode::Put.code() as u16);
            }
            ResponseStatus::NO_ERROR
        }
        OpCode::IterationStart => {
            let segments = read_optional_array(body)?
                .map(|bits| bitset_to_segments(&bits).into_iter().collect::<BTreeSet<u32>>());
            if read_optional_array(body)?.is_some() {
                let params = read_u8(body)?;
                for _ in 0..params {
                    read_array(body)?;
                }
            }
            let batch_size = read_vint(body)?.max(1) as usize;
            let metadata = read_u8(body)? != 0;

            let segment_count = state.segment_count();
            let requested =
                segments.unwrap_or_else(|| (0..segment_count).collect::<BTreeSet<u32>>());
            let mut entries: Vec<(u32, Bytes, Bytes, u64)> = state
                .data
                .iter()
                .map(|(k, s)| (hash::segment_of(k, segment_count), k.clone(), s.value.clone(), s.version))
                .filter(|(segment, ..)| requested.contains(segment))
                .collect();
            entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

            state.next_iteration += 1;
            let id = format!("{}-iter-{}", address.host, state.next_iteration);
            state.iterations.insert(
                id.clone(),
                Iteration {
                    entries: entries.into(),
                    pending_segments: requested,
                    batch_size,
                    metadata,
                },
            );
            write_string(&mut out, &id);
            ResponseStatus::NO_ERROR
        }
        OpCode::IterationNext => {
            let id = read_string(body)?;
            match state.iterations.get_mut(&id) {
                None => ResponseStatus::INVALID_ITERATION,
                Some(iteration) => {
                    let take = iteration.batch_size.min(iteration.entries.len());
                    let batch: Vec<_> = iteration.entries.drain(..take).collect();
                    let remaining: BTreeSet<u32> =
                        iteration.entries.iter().map(|e| e.0).collect();
                    let finished: Vec<u32> = iteration
                        .pending_segments
                        .iter()
                        .copied()
                        .filter(|s| !remaining.contains(s))
                        .collect();
                    for segment in &finished {
                        iteration.pending_segments.remove(segment);
                    }
                    let page = IterationPage {
                        finished_segments: finished,
                        entries: batch
                            .into_iter()
                            .map(|(_, key, value, version)| {
                                let metadata = iteration.metadata.then(|| EntryMetadata {
                                    version,
                                    ..Default::default()
                                });
                                ScanEntry::new(key, value, metadata)
                            })
                            .collect(),
                    };
                    write_page(&mut out, &page);
                    ResponseStatus::NO_ERROR
                }
            }
        }
        OpCode::IterationEnd => {
            let id = read_string(body)?;
            match state.iterations.remove(&id) {
                Some(_) => ResponseStatus::NO_ERROR,
                None => ResponseStatus::INVALID_ITERATION,
            }
        }
        OpCode::AddClientListener | OpCode::RemoveClientListener => ResponseStatus::NO_ERROR,
        other => {
            return Err(ClientError::Protocol(format!(
                "{} is not served by the fake cluster",
                other.name()
            )))
        }
    };
    Ok((status, out))
}

#[async_trait]
impl ChannelProvider for FakeCluster {
    async fn acquire_channel(&self, target: &ChannelTarget) -> Result<Box<dyn Channel>> {
        let mut state = self.state.lock();
        let address = match target {
            ChannelTarget::Address(address) => address.clone(),
            ChannelTarget::Any => state
                .servers()
                .into_iter()
                .find(|s| !state.down.contains(s))
                .ok_or_else(|| ClientError::Connection("no live servers".into()))?,
        };
        if state.down.contains(&address) {
            return Err(ClientError::Connection(format!(
                "connection refused by {}",
                address
            )));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.acquired.push(id);
        Ok(Box::new(FakeChannel {
            id,
            address,
            cluster: self.clone(),
            pending: VecDeque::new(),
        }))
    }

    fn release_channel(&self, channel: Box<dyn Channel>) {
        self.state.lock().released.push(channel.id());
    }

    fn discard_channel(&self, channel: Box<dyn Channel>) {
        self.state.lock().discarded.push(channel.id());
    }

    fn negotiated_codec_version(&self, _channel: &dyn Channel) -> ProtocolVersion {
        self.state.lock().version
    }
}

/// Channel whose responses become readable after the node's delay
pub(crate) struct FakeChannel {
    id: u64,
    address: NodeAddress,
    cluster: FakeCluster,
    pending: VecDeque<(Instant, Bytes)>,
}

impl std::fmt::Debug for FakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeChannel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn write_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
        if self.cluster.is_down(&self.address) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("{} reset the connection", self.address),
            ));
        }
        let (response, delay) = self.cluster.serve(&self.address, frame);
        self.pending.push_back((Instant::now() + delay, response));
        Ok(())
    }

    // the frame is only popped after the sleep, so a dropped read loses nothing
    async fn read_frame(&mut self) -> std::io::Result<Bytes> {
        let ready_at = match self.pending.front() {
            Some((ready_at, _)) => *ready_at,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "no response pending",
                ))
            }
        };
        tokio::time::sleep_until(ready_at).await;
        self.pending.pop_front().map(|(_, frame)| frame).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no response pending")
        })
    }
}
