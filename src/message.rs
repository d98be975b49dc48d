//! D-Bus message records.
//!
//! The engine treats a message as a typed record: a set of header fields and
//! an opaque body. On-the-wire framing is the stream's concern; body values
//! are (de)serialized with zvariant using the D-Bus encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use zvariant::serialized::{Context, Data};
use zvariant::{Endian, Type};

use crate::error::{Error, Result};

/// Message kinds from the D-Bus wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
    /// A kind byte outside the defined range.
    Invalid,
}

/// A message body: zvariant-encoded bytes plus their D-Bus signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    signature: Option<String>,
    bytes: Vec<u8>,
}

impl Body {
    /// An empty body with no signature.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Encode a value as a little-endian D-Bus body.
    pub fn serialize<B: Serialize + Type>(value: &B) -> Result<Self> {
        let ctxt = Context::new_dbus(Endian::Little, 0);
        let data =
            zvariant::to_bytes(ctxt, value).map_err(|e| Error::Serialize(e.to_string()))?;
        Ok(Self {
            signature: body_signature::<B>(),
            bytes: data.bytes().to_vec(),
        })
    }

    /// Decode the body as a value of type `B`.
    pub fn deserialize<B: DeserializeOwned + Type>(&self) -> Result<B> {
        let ctxt = Context::new_dbus(Endian::Little, 0);
        let data = Data::new(self.bytes.clone(), ctxt);
        let (value, _) = data
            .deserialize()
            .map_err(|e| Error::Deserialize(e.to_string()))?;
        Ok(value)
    }

    /// The D-Bus signature of the body, if any.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The signature carried in the message header for a body of type `B`.
///
/// A message body is a sequence of arguments, so a tuple's outer parens are
/// stripped, mirroring the wire format's signature header field.
fn body_signature<B: Type>() -> Option<String> {
    let sig = B::SIGNATURE.to_string();
    if sig.is_empty() {
        return None;
    }
    match sig.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => Some(inner.to_string()),
        None => Some(sig),
    }
}

/// A D-Bus message.
///
/// `serial` is 0 until the connection assigns one; once the frame has been
/// handed to the stream the serial never changes.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    serial: u32,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error_name: Option<String>,
    reply_expected: bool,
    body: Body,
}

impl Message {
    /// Start building a method call.
    pub fn method_call(path: &str, interface: &str, member: &str) -> MessageBuilder {
        MessageBuilder {
            msg: Message {
                kind: MessageKind::MethodCall,
                serial: 0,
                reply_serial: None,
                path: Some(path.to_string()),
                interface: Some(interface.to_string()),
                member: Some(member.to_string()),
                destination: None,
                sender: None,
                error_name: None,
                reply_expected: true,
                body: Body::empty(),
            },
        }
    }

    /// Start building a signal.
    pub fn signal(path: &str, interface: &str, member: &str) -> MessageBuilder {
        let mut builder = Self::method_call(path, interface, member);
        builder.msg.kind = MessageKind::Signal;
        builder.msg.reply_expected = false;
        builder
    }

    /// Start building a method return for `request`.
    ///
    /// Copies the request serial into `reply_serial` and addresses the reply
    /// to the request's sender.
    pub fn method_return(request: &Message) -> MessageBuilder {
        MessageBuilder {
            msg: Message {
                kind: MessageKind::MethodReturn,
                serial: 0,
                reply_serial: Some(request.serial),
                path: None,
                interface: None,
                member: None,
                destination: request.sender.clone(),
                sender: None,
                error_name: None,
                reply_expected: false,
                body: Body::empty(),
            },
        }
    }

    /// Start building an error reply to `request`.
    pub fn error_reply(request: &Message, error_name: &str) -> MessageBuilder {
        let mut builder = Self::method_return(request);
        builder.msg.kind = MessageKind::Error;
        builder.msg.error_name = Some(error_name.to_string());
        builder
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The assigned serial, or 0 if none has been assigned yet.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn reply_expected(&self) -> bool {
        self.reply_expected
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_method_call(&self) -> bool {
        self.kind == MessageKind::MethodCall
    }

    pub fn is_signal(&self) -> bool {
        self.kind == MessageKind::Signal
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    pub(crate) fn assign_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub(crate) fn set_reply_serial(&mut self, serial: Option<u32>) {
        self.reply_serial = serial;
    }

    pub(crate) fn set_destination(&mut self, destination: Option<String>) {
        self.destination = destination;
    }
}

/// Builder for [`Message`] values.
#[derive(Debug)]
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    pub fn destination(mut self, destination: &str) -> Self {
        self.msg.destination = Some(destination.to_string());
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.msg.sender = Some(sender.to_string());
        self
    }

    /// Mark the message as wanting no reply.
    pub fn no_reply_expected(mut self) -> Self {
        self.msg.reply_expected = false;
        self
    }

    /// Set an explicit serial. The connection assigns serials to outbound
    /// messages itself; this is for constructing inbound frames by hand.
    pub fn serial(mut self, serial: u32) -> Self {
        self.msg.serial = serial;
        self
    }

    /// Encode `value` as the message body.
    pub fn body<B: Serialize + Type>(mut self, value: &B) -> Result<Self> {
        self.msg.body = Body::serialize(value)?;
        Ok(self)
    }

    pub fn build(self) -> Message {
        self.msg
    }
}

/// Common D-Bus error names.
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
}
