//! Client listener registration
//!
//! Events themselves arrive on the registering channel and are consumed by
//! an external notifier; these operations only manage the registration.

use super::{DecodeContext, Operation, Routing};
use crate::codec::wire::{write_array, write_string};
use crate::codec::{OpCode, ProtocolVersion, ResponseStatus};
use crate::error::Result;
use crate::types::{ListenerRegistration, NodeAddress};
use bytes::{BufMut, Bytes, BytesMut};

/// A named server-side factory (filter, converter) and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryRef {
    pub name: String,
    pub params: Vec<Bytes>,
}

impl FactoryRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<Bytes>) -> Self {
        self.params.push(param.into());
        self
    }
}

/// Name (empty when absent), then parameter count and values when present
pub(crate) fn write_factory(buf: &mut BytesMut, factory: Option<&FactoryRef>) {
    match factory {
        Some(factory) => {
            write_string(buf, &factory.name);
            buf.put_u8(factory.params.len() as u8);
            for param in &factory.params {
                write_array(buf, param);
            }
        }
        None => write_string(buf, ""),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub include_current_state: bool,
    pub filter: Option<FactoryRef>,
    pub converter: Option<FactoryRef>,
    pub use_raw_data: bool,
}

#[derive(Debug, Clone)]
pub struct AddClientListenerOperation {
    listener_id: Bytes,
    options: ListenerOptions,
}

impl AddClientListenerOperation {
    pub fn new(options: ListenerOptions) -> Self {
        let listener_id = Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self {
            listener_id,
            options,
        }
    }

    pub fn listener_id(&self) -> &Bytes {
        &self.listener_id
    }
}

impl Operation for AddClientListenerOperation {
    type Output = ListenerRegistration;

    fn op_code(&self) -> OpCode {
        OpCode::AddClientListener
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.listener_id);
        buf.put_u8(self.options.include_current_state as u8);
        write_factory(buf, self.options.filter.as_ref());
        write_factory(buf, self.options.converter.as_ref());
        buf.put_u8(self.options.use_raw_data as u8);
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        _body: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<ListenerRegistration> {
        Ok(ListenerRegistration {
            listener_id: self.listener_id.clone(),
            address: ctx.address.clone(),
        })
    }
}

/// Remove a listener from the node that registered it
#[derive(Debug, Clone)]
pub struct RemoveClientListenerOperation {
    listener_id: Bytes,
    address: NodeAddress,
}

impl RemoveClientListenerOperation {
    pub fn new(registration: &ListenerRegistration) -> Self {
        Self {
            listener_id: registration.listener_id.clone(),
            address: registration.address.clone(),
        }
    }
}

impl Operation for RemoveClientListenerOperation {
    type Output = ();

    fn op_code(&self) -> OpCode {
        OpCode::RemoveClientListener
    }

    fn routing(&self) -> Routing {
        Routing::Address(self.address.clone())
    }

    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        write_array(buf, &self.listener_id);
    }

    fn decode(
        &self,
        _status: ResponseStatus,
        _body: &mut Bytes,
        _ctx: &DecodeContext<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_ids_are_unique() {
        let a = AddClientListenerOperation::new(ListenerOptions::default());
        let b = AddClientListenerOperation::new(ListenerOptions::default());
        assert_eq!(a.listener_id().len(), 16);
        assert_ne!(a.listener_id(), b.listener_id());
    }

    #[test]
    fn test_add_listener_body() {
        let op = AddClientListenerOperation::new(ListenerOptions {
            include_current_state: true,
            filter: Some(FactoryRef::new("f").with_param(&b"p"[..])),
            converter: None,
            use_raw_data: false,
        });
        let mut buf = BytesMut::new();
        op.encode(ProtocolVersion::V31, &mut buf);

        let mut expected = BytesMut::new();
        write_array(&mut expected, op.listener_id());
        expected.put_slice(&[1, 1, b'f', 1, 1, b'p', 0, 0]);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_remove_goes_to_registering_node() {
        let registration = ListenerRegistration {
            listener_id: Bytes::from_static(b"id"),
            address: NodeAddress::new("b", 11222),
        };
        let op = RemoveClientListenerOperation::new(&registration);
        assert_eq!(op.routing(), Routing::Address(NodeAddress::new("b", 11222)));
    }
}
