//! XA transaction prepare

use super::{DecodeContext, Operation};
use crate::codec::wire::{read_i32, write_array, write_expiration, write_signed_vint, write_vint, write_vlong};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::{ClientError, Result};
use crate::types::{Modification, Xid};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

const CONTROL_NOT_READ: u8 = 0x01;
const CONTROL_NON_EXISTING: u8 = 0x02;
const CONTROL_REMOVE: u8 = 0x04;

pub(crate) fn write_xid(buf: &mut BytesMut, xid: &Xid) {
    write_signed_vint(buf, xid.format_id);
    write_array(buf, &xid.global_transaction_id);
    write_array(buf, &xid.branch_qualifier);
}

fn control_byte(modification: &Modification) -> u8 {
    let mut control = 0;
    if modification.version_read.is_none() && !modification.read_absent {
        control |= CONTROL_NOT_READ;
    }
    if modification.read_absent {
        control |= CONTROL_NON_EXISTING;
    }
    if modification.value.is_none() {
        control |= CONTROL_REMOVE;
    }
    control
}

/// Send the transaction's writes for validation; yields the XA vote
#[derive(Debug, Clone)]
pub struct PrepareTransactionOperation {
    xid: Xid,
    one_phase_commit: bool,
    recoverable: bool,
    timeout: Duration,
    modifications: Vec<Modification>,
}

impl PrepareTransactionOperation {
    pub fn new(
        xid: Xid,
        one_phase_commit: bool,
        recoverable: bool,
        timeout: Duration,
        modifications: Vec<Modification>,
    ) -> Result<Self> {
        if xid.is_null() {
            return Err(ClientError::InvalidArgument(
                "Transaction prepare requires a non-null xid".into(),
            ));
        }
        Ok(Self {
            xid,
            one_phase_commit,
            recoverable,
            timeout,
            modifications,
        })
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }
}

impl Operation for PrepareTransactionOperation {
    type Output = i32;

    fn op_code(&self) -> OpCode {
        OpCode::PrepareTransaction
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_xid(buf, &self.xid);
        buf.put_u8(self.one_phase_commit as u8);
        buf.put_u8(self.recoverable as u8);
        write_vlong(buf, self.timeout.as_millis() as u64);
        write_vint(buf, self.modifications.len() as u32);
        for modification in &self.modifications {
            write_array(buf, &modification.key);
            let control = control_byte(modification);
            buf.put_u8(control);
            if let Some(version) = modification.version_read {
                if control & CONTROL_NON_EXISTING == 0 {
                    buf.put_u64(version);
                }
            }
            if let Some(value) = &modification.value {
                write_expiration(buf, &modification.expiration);
                write_array(buf, value);
            }
        }
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<i32> {
        read_i32(body)
    }
}
