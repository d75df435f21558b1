//! SASL handshake steps, always sent to the node being authenticated

use super::{DecodeContext, Operation, Routing};
use crate::codec::wire::{read_array, read_string, read_u8, read_vint, write_array, write_string};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::Result;
use crate::types::{AuthResult, NodeAddress};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone)]
pub struct AuthMechListOperation {
    address: NodeAddress,
}

impl AuthMechListOperation {
    pub fn new(address: NodeAddress) -> Self {
        Self { address }
    }
}

impl Operation for AuthMechListOperation {
    type Output = Vec<String>;

    fn op_code(&self) -> OpCode {
        OpCode::AuthMechList
    }

    fn routing(&self) -> Routing {
        Routing::Address(self.address.clone())
    }

    fn encode(&self, _version: ProtocolVersion, _buf: &mut BytesMut) {}

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<Vec<String>> {
        let count = read_vint(body)?;
        (0..count).map(|_| read_string(body)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct AuthOperation {
    address: NodeAddress,
    mechanism: String,
    response: Bytes,
}

impl AuthOperation {
    pub fn new(address: NodeAddress, mechanism: impl Into<String>, response: Bytes) -> Self {
        Self {
            address,
            mechanism: mechanism.into(),
            response,
        }
    }
}

impl Operation for AuthOperation {
    type Output = AuthResult;

    fn op_code(&self) -> OpCode {
        OpCode::Auth
    }

    fn routing(&self) -> Routing {
        Routing::Address(self.address.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_string(buf, &self.mechanism);
        write_array(buf, &self.response);
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<AuthResult> {
        let complete = read_u8(body)? != 0;
        let challenge = read_array(body)?;
        Ok(AuthResult {
            complete,
            challenge,
        })
    }
}
