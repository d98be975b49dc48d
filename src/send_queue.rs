//! Outbound send queue.
//!
//! Every sender enqueues a [`PendingSend`] onto an unbounded FIFO; a single
//! writer task drains it onto the stream, so frames reach the wire in
//! enqueue order. Cancellation is honored up to the moment the writer picks
//! an entry up; the stream write itself is never interrupted.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::stream::MessageStream;

/// A message queued for transmission.
pub struct PendingSend {
    pub(crate) message: Message,
    /// Resolved exactly once: success, transport failure, or cancelled.
    pub(crate) done: oneshot::Sender<Result<()>>,
    pub(crate) cancel: CancellationToken,
}

/// Drain the queue onto the stream until the queue closes.
///
/// A write failure fails that entry's completion slot only; tearing the
/// connection down is the receiver loop's call.
pub(crate) async fn run_writer(
    stream: Arc<dyn MessageStream>,
    mut queue: mpsc::UnboundedReceiver<PendingSend>,
) {
    while let Some(entry) = queue.recv().await {
        if entry.cancel.is_cancelled() {
            trace!(serial = entry.message.serial(), "Dropping cancelled send");
            let _ = entry.done.send(Err(Error::Cancelled));
            continue;
        }
        match stream.send(&entry.message).await {
            Ok(()) => {
                trace!(serial = entry.message.serial(), "Sent message");
                let _ = entry.done.send(Ok(()));
            }
            Err(e) => {
                warn!(
                    serial = entry.message.serial(),
                    error = %e,
                    "Failed to write message"
                );
                let _ = entry.done.send(Err(e.into()));
            }
        }
    }
    trace!("Writer loop terminated");
}
