//! Serial allocation and pending-reply correlation.
//!
//! Every outbound message gets a connection-unique, non-zero serial. Method
//! calls that expect a reply park a one-shot slot here, keyed by that serial;
//! the receiver loop resolves the slot when the matching reply frame arrives,
//! and disconnect drains whatever is left.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::message::Message;

/// Allocator for outbound message serials.
///
/// Serials are non-zero 32-bit values handed out in increasing order. An
/// unassigned message carries serial 0, so the zero slot is skipped on
/// wrap-around; a connection with 2^32 frames still in flight is out of
/// practical scope.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    last: AtomicU32,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next serial.
    pub fn next(&self) -> u32 {
        loop {
            let serial = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }
}

/// One-shot slot a caller waits on for its reply.
pub type ReplySlot = oneshot::Sender<Result<Message>>;

/// Outstanding method calls awaiting a reply, keyed by request serial.
#[derive(Debug, Default)]
pub struct PendingReplies {
    slots: HashMap<u32, ReplySlot>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a slot for `serial` and hand back the receiving half.
    pub fn insert(&mut self, serial: u32) -> oneshot::Receiver<Result<Message>> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(serial, tx);
        rx
    }

    /// Look up and remove the slot waiting on `reply_serial`.
    pub fn remove(&mut self, reply_serial: u32) -> Option<ReplySlot> {
        self.slots.remove(&reply_serial)
    }

    /// Take every outstanding slot, leaving the table empty.
    ///
    /// Used on disconnect so all waiters can be failed with the same reason
    /// outside the connection lock.
    pub fn drain(&mut self) -> Vec<ReplySlot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
