//! Cache-wide operations and server tasks

use super::{DecodeContext, Operation, Routing};
use crate::codec::wire::{
    read_array, read_string, read_u16, read_u8, read_vint, read_vlong, write_array, write_string,
    write_vint,
};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::Result;
use crate::types::{NodeAddress, PingResponse, ServerStatistics};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// Admin tasks are server tasks whose name carries this prefix
pub const ADMIN_TASK_PREFIX: &str = "@@";

#[derive(Debug, Clone, Default)]
pub struct ClearOperation;

impl Operation for ClearOperation {
    type Output = ();

    fn op_code(&self) -> OpCode {
        OpCode::Clear
    }

    fn encode(&self, _version: ProtocolVersion, _buf: &mut BytesMut) {}

    fn decode(
        &self,
        _status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SizeOperation;

impl Operation for SizeOperation {
    type Output = u64;

    fn op_code(&self) -> OpCode {
        OpCode::Size
    }

    fn encode(&self, _version: ProtocolVersion, _buf: &mut BytesMut) {}

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<u64> {
        read_vlong(body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsOperation;

impl Operation for StatsOperation {
    type Output = ServerStatistics;

    fn op_code(&self) -> OpCode {
        OpCode::Stats
    }

    fn encode(&self, _version: ProtocolVersion, _buf: &mut BytesMut) {}

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<ServerStatistics> {
        let count = read_vint(body)? as usize;
        let mut stats = HashMap::with_capacity(count.min(256));
        for _ in 0..count {
            let name = read_string(body)?;
            let value = read_string(body)?;
            stats.insert(name, value);
        }
        Ok(ServerStatistics { stats })
    }
}

/// Liveness check. Bound to a node, or to any node for fault-tolerant
/// topology discovery.
#[derive(Debug, Clone)]
pub struct PingOperation {
    target: Option<NodeAddress>,
}

impl PingOperation {
    pub fn new(target: Option<NodeAddress>) -> Self {
        Self { target }
    }
}

fn skip_media_type(body: &mut Bytes) -> Result<()> {
    match read_u8(body)? {
        0 => return Ok(()),
        1 => {
            read_vint(body)?;
        }
        _ => {
            read_string(body)?;
        }
    }
    let params = read_vint(body)?;
    for _ in 0..params {
        read_string(body)?;
        read_string(body)?;
    }
    Ok(())
}

impl Operation for PingOperation {
    type Output = PingResponse;

    fn op_code(&self) -> OpCode {
        OpCode::Ping
    }

    fn routing(&self) -> Routing {
        match &self.target {
            Some(address) => Routing::Address(address.clone()),
            None => Routing::Any,
        }
    }

    fn encode(&self, _version: ProtocolVersion, _buf: &mut BytesMut) {}

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<PingResponse> {
        if !ctx.version.has_ping_capabilities() {
            return Ok(PingResponse::default());
        }
        skip_media_type(body)?;
        skip_media_type(body)?;
        let server_version = read_u8(body)?;
        let count = read_vint(body)?;
        let mut supported_ops = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            supported_ops.push(read_u16(body)?);
        }
        Ok(PingResponse {
            server_version: Some(server_version),
            supported_ops,
        })
    }
}

/// All keys of the cache; `scope` 0 asks for the whole cluster
#[derive(Debug, Clone, Default)]
pub struct BulkGetKeysOperation {
    scope: u32,
}

impl BulkGetKeysOperation {
    pub fn new(scope: u32) -> Self {
        Self { scope }
    }
}

impl Operation for BulkGetKeysOperation {
    type Output = Vec<Bytes>;

    fn op_code(&self) -> OpCode {
        OpCode::BulkGetKeys
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_vint(buf, self.scope);
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Vec<Bytes>> {
        let mut keys = Vec::new();
        while read_u8(body)? != 0 {
            keys.push(read_array(body)?);
        }
        Ok(keys)
    }
}

/// Run a named server task, optionally on the owner of `key`
#[derive(Debug, Clone)]
pub struct ExecOperation {
    task: String,
    params: Vec<(String, Bytes)>,
    key: Option<Bytes>,
}

impl ExecOperation {
    pub fn new(task: impl Into<String>, params: Vec<(String, Bytes)>, key: Option<Bytes>) -> Self {
        Self {
            task: task.into(),
            params,
            key,
        }
    }

    /// Admin tasks run on any node
    pub fn admin(task: &str, params: Vec<(String, Bytes)>) -> Self {
        let task = if task.starts_with(ADMIN_TASK_PREFIX) {
            task.to_string()
        } else {
            format!("{}{}", ADMIN_TASK_PREFIX, task)
        };
        Self::new(task, params, None)
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

impl Operation for ExecOperation {
    type Output = Bytes;

    fn op_code(&self) -> OpCode {
        OpCode::Exec
    }

    fn routing(&self) -> Routing {
        match &self.key {
            Some(key) => Routing::Key(key.clone()),
            None => Routing::Any,
        }
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_string(buf, &self.task);
        write_vint(buf, self.params.len() as u32);
        for (name, value) in &self.params {
            write_string(buf, name);
            write_array(buf, value);
        }
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Bytes> {
        read_array(body)
    }
}
