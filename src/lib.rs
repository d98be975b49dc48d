//! dbus-courier - client-side D-Bus connection engine.
//!
//! This crate multiplexes method calls, replies, signals, and bus-service
//! notifications over a single authenticated message stream to a bus daemon
//! (session or system) or a directly connected peer. It owns the connection
//! state machine, the serial allocator, the pending-reply table, the signal
//! and name-owner subscription tables, the outbound send queue, and the
//! inbound demultiplexer.
//!
//! Transport setup, SASL authentication, and the wire marshaling format are
//! deliberately out of scope: the engine consumes an already-authenticated
//! [`stream::MessageStream`] and treats messages as typed records with
//! zvariant-encoded bodies.

pub mod address;
pub mod connection;
pub mod error;
pub mod match_rules;
pub mod message;
pub mod names;
pub mod router;
pub mod send_queue;
pub mod serial_map;
pub mod stream;

pub use connection::{
    Connection, ConnectionState, DisconnectHandler, MethodHandler, NameOwnerRegistration,
    SignalRegistration,
};
pub use error::{Error, Result};
pub use match_rules::{OwnerChangedMatchRule, SignalMatchRule};
pub use message::{Body, Message, MessageBuilder, MessageKind};
pub use names::{NameCallback, ReleaseNameReply, RequestNameReply};
pub use router::{NameOwnerHandler, SignalHandler};
pub use stream::{MessageStream, StreamConnector};
