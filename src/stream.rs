//! The authenticated message-stream seam.
//!
//! The engine runs on top of an already-authenticated, ordered, framed duplex
//! channel. Production implementations wrap a Unix or TCP socket and perform
//! the SASL handshake before handing the stream over; tests substitute
//! in-memory channels. The engine itself never touches raw transports.

use async_trait::async_trait;

use crate::address::AddressEntry;
use crate::error::Result;
use crate::message::Message;

/// An ordered, framed duplex channel to a bus daemon or a peer.
#[async_trait]
pub trait MessageStream: Send + Sync + 'static {
    /// Send one framed message.
    ///
    /// Completes once the frame has been handed to the transport. Errors are
    /// transport failures for this frame only; the caller decides whether
    /// they are fatal.
    async fn send(&self, msg: &Message) -> std::io::Result<()>;

    /// Receive the next framed message.
    ///
    /// `Ok(None)` means the peer closed the stream in an orderly fashion.
    async fn recv(&self) -> std::io::Result<Option<Message>>;
}

/// Opens authenticated message streams from parsed address entries.
///
/// A connector tries exactly one entry per call; the connection walks the
/// entry list in order until one opens.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, entry: &AddressEntry) -> Result<Box<dyn MessageStream>>;
}
