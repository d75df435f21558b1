//! Hot Rod binary protocol encoding
//!
//! Frames are built from a request header, written by [`header`], followed
//! by an operation-specific body. Primitive encodings (variable-length
//! integers, arrays, strings, expiration) live in [`wire`].

pub mod header;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use header::{
    read_response_header, read_topology_update, write_request_header, write_topology_update,
    RequestHeader, ResponseHeader, TopologyUpdate,
};

pub const REQUEST_MAGIC: u8 = 0xA0;
pub const RESPONSE_MAGIC: u8 = 0xA1;

/// Hash function version advertised for MurmurHash3 segment maps
pub const HASH_FUNCTION_MURMUR3: u8 = 0x03;

/// Protocol versions this client can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "2.5")]
    V25,
    #[serde(rename = "2.6")]
    V26,
    #[serde(rename = "2.7")]
    V27,
    #[serde(rename = "2.8")]
    V28,
    #[serde(rename = "2.9")]
    V29,
    #[serde(rename = "3.0")]
    V30,
    #[serde(rename = "3.1")]
    V31,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V31
    }
}

impl ProtocolVersion {
    pub fn code(self) -> u8 {
        match self {
            ProtocolVersion::V25 => 25,
            ProtocolVersion::V26 => 26,
            ProtocolVersion::V27 => 27,
            ProtocolVersion::V28 => 28,
            ProtocolVersion::V29 => 29,
            ProtocolVersion::V30 => 30,
            ProtocolVersion::V31 => 31,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            25 => Some(ProtocolVersion::V25),
            26 => Some(ProtocolVersion::V26),
            27 => Some(ProtocolVersion::V27),
            28 => Some(ProtocolVersion::V28),
            29 => Some(ProtocolVersion::V29),
            30 => Some(ProtocolVersion::V30),
            31 => Some(ProtocolVersion::V31),
            _ => None,
        }
    }

    /// Request headers carry key/value media types from 2.8 on
    pub fn has_media_types(self) -> bool {
        self >= ProtocolVersion::V28
    }

    /// Ping responses advertise server version and operations from 3.0 on
    pub fn has_ping_capabilities(self) -> bool {
        self >= ProtocolVersion::V30
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        write!(f, "{}.{}", code / 10, code % 10)
    }
}

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Put,
    Get,
    PutIfAbsent,
    Replace,
    ReplaceIfUnmodified,
    Remove,
    RemoveIfUnmodified,
    ContainsKey,
    Clear,
    Stats,
    Ping,
    GetWithMetadata,
    BulkGetKeys,
    AuthMechList,
    Auth,
    AddClientListener,
    RemoveClientListener,
    Size,
    Exec,
    PutAll,
    GetAll,
    IterationStart,
    IterationNext,
    IterationEnd,
    GetStream,
    PutStream,
    PrepareTransaction,
}

impl OpCode {
    pub fn code(self) -> u8 {
        match self {
            OpCode::Put => 0x01,
            OpCode::Get => 0x03,
            OpCode::PutIfAbsent => 0x05,
            OpCode::Replace => 0x07,
            OpCode::ReplaceIfUnmodified => 0x09,
            OpCode::Remove => 0x0B,
            OpCode::RemoveIfUnmodified => 0x0D,
            OpCode::ContainsKey => 0x0F,
            OpCode::Clear => 0x13,
            OpCode::Stats => 0x15,
            OpCode::Ping => 0x17,
            OpCode::GetWithMetadata => 0x1B,
            OpCode::BulkGetKeys => 0x1D,
            OpCode::AuthMechList => 0x21,
            OpCode::Auth => 0x23,
            OpCode::AddClientListener => 0x25,
            OpCode::RemoveClientListener => 0x27,
            OpCode::Size => 0x29,
            OpCode::Exec => 0x2B,
            OpCode::PutAll => 0x2D,
            OpCode::GetAll => 0x2F,
            OpCode::IterationStart => 0x31,
            OpCode::IterationNext => 0x33,
            OpCode::IterationEnd => 0x35,
            OpCode::GetStream => 0x37,
            OpCode::PutStream => 0x39,
            OpCode::PrepareTransaction => 0x3B,
        }
    }

    /// Opcode the server uses for a successful response
    pub fn response_code(self) -> u8 {
        self.code() + 1
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.code() == code)
    }

    /// Label for logs and metrics
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Put => "put",
            OpCode::Get => "get",
            OpCode::PutIfAbsent => "put_if_absent",
            OpCode::Replace => "replace",
            OpCode::ReplaceIfUnmodified => "replace_if_unmodified",
            OpCode::Remove => "remove",
            OpCode::RemoveIfUnmodified => "remove_if_unmodified",
            OpCode::ContainsKey => "contains_key",
            OpCode::Clear => "clear",
            OpCode::Stats => "stats",
            OpCode::Ping => "ping",
            OpCode::GetWithMetadata => "get_with_metadata",
            OpCode::BulkGetKeys => "bulk_get_keys",
            OpCode::AuthMechList => "auth_mech_list",
            OpCode::Auth => "auth",
            OpCode::AddClientListener => "add_client_listener",
            OpCode::RemoveClientListener => "remove_client_listener",
            OpCode::Size => "size",
            OpCode::Exec => "exec",
            OpCode::PutAll => "put_all",
            OpCode::GetAll => "get_all",
            OpCode::IterationStart => "iteration_start",
            OpCode::IterationNext => "iteration_next",
            OpCode::IterationEnd => "iteration_end",
            OpCode::GetStream => "get_stream",
            OpCode::PutStream => "put_stream",
            OpCode::PrepareTransaction => "prepare_transaction",
        }
    }

    const ALL: [OpCode; 27] = [
        OpCode::Put,
        OpCode::Get,
        OpCode::PutIfAbsent,
        OpCode::Replace,
        OpCode::ReplaceIfUnmodified,
        OpCode::Remove,
        OpCode::RemoveIfUnmodified,
        OpCode::ContainsKey,
        OpCode::Clear,
        OpCode::Stats,
        OpCode::Ping,
        OpCode::GetWithMetadata,
        OpCode::BulkGetKeys,
        OpCode::AuthMechList,
        OpCode::Auth,
        OpCode::AddClientListener,
        OpCode::RemoveClientListener,
        OpCode::Size,
        OpCode::Exec,
        OpCode::PutAll,
        OpCode::GetAll,
        OpCode::IterationStart,
        OpCode::IterationNext,
        OpCode::IterationEnd,
        OpCode::GetStream,
        OpCode::PutStream,
        OpCode::PrepareTransaction,
    ];
}

/// Opcode of an error response
pub const ERROR_RESPONSE: u8 = 0x50;

/// Response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatus(pub u8);

impl ResponseStatus {
    pub const NO_ERROR: ResponseStatus = ResponseStatus(0x00);
    pub const NOT_PUT_REMOVED_REPLACED: ResponseStatus = ResponseStatus(0x01);
    pub const KEY_DOES_NOT_EXIST: ResponseStatus = ResponseStatus(0x02);
    pub const SUCCESS_WITH_PREVIOUS: ResponseStatus = ResponseStatus(0x03);
    pub const NOT_EXECUTED_WITH_PREVIOUS: ResponseStatus = ResponseStatus(0x04);
    pub const INVALID_ITERATION: ResponseStatus = ResponseStatus(0x05);
    pub const NO_ERROR_COMPAT: ResponseStatus = ResponseStatus(0x06);
    pub const SUCCESS_WITH_PREVIOUS_COMPAT: ResponseStatus = ResponseStatus(0x07);
    pub const NOT_EXECUTED_WITH_PREVIOUS_COMPAT: ResponseStatus = ResponseStatus(0x08);
    pub const INVALID_MAGIC_OR_MESSAGE_ID: ResponseStatus = ResponseStatus(0x81);
    pub const UNKNOWN_COMMAND: ResponseStatus = ResponseStatus(0x82);
    pub const UNKNOWN_VERSION: ResponseStatus = ResponseStatus(0x83);
    pub const REQUEST_PARSING_ERROR: ResponseStatus = ResponseStatus(0x84);
    pub const SERVER_ERROR: ResponseStatus = ResponseStatus(0x85);
    pub const COMMAND_TIMEOUT: ResponseStatus = ResponseStatus(0x86);
    pub const NODE_SUSPECTED: ResponseStatus = ResponseStatus(0x87);
    pub const ILLEGAL_LIFECYCLE_STATE: ResponseStatus = ResponseStatus(0x88);

    pub fn is_success(self) -> bool {
        matches!(self.0, 0x00 | 0x03 | 0x06 | 0x07)
    }

    pub fn is_not_executed(self) -> bool {
        matches!(self.0, 0x01 | 0x04 | 0x08)
    }

    pub fn is_not_exist(self) -> bool {
        self == Self::KEY_DOES_NOT_EXIST
    }

    pub fn has_previous(self) -> bool {
        matches!(self.0, 0x03 | 0x04 | 0x07 | 0x08)
    }

    pub fn is_invalid_iteration(self) -> bool {
        self == Self::INVALID_ITERATION
    }

    pub fn is_error(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Error statuses that mean "try another node" rather than a real failure
    pub fn is_transient_error(self) -> bool {
        self == Self::NODE_SUSPECTED || self == Self::ILLEGAL_LIFECYCLE_STATE
    }
}
