//! Handler-chain tables for signal and name-owner dispatch.
//!
//! A chain holds the handlers registered for one key (a signal match rule or
//! a watched service name), in registration order. The tables themselves are
//! plain data guarded by the connection lock; the receiver loop snapshots a
//! chain under the lock and invokes the handlers after releasing it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;

/// Handler invoked for each inbound signal matching its rule.
///
/// An `Err` from a handler is treated as a bug and tears the connection
/// down.
pub type SignalHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Handler invoked with `(old_owner, new_owner)` when a watched well-known
/// name changes hands. Empty owner strings arrive as `None`.
pub type NameOwnerHandler =
    Arc<dyn Fn(Option<&str>, Option<&str>) -> Result<()> + Send + Sync>;

/// Ordered handler chains keyed by `K`.
#[derive(Debug)]
pub struct RuleRouter<K, H> {
    chains: HashMap<K, Vec<(u64, H)>>,
    next_id: u64,
}

impl<K: Eq + Hash + Clone, H: Clone> Default for RuleRouter<K, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, H: Clone> RuleRouter<K, H> {
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
            next_id: 0,
        }
    }

    /// Append `handler` to the chain for `key`.
    ///
    /// Returns the handler's id and whether it is the first entry for the
    /// key (i.e. the key needs a bus-side match registration).
    pub fn add(&mut self, key: K, handler: H) -> (u64, bool) {
        let id = self.next_id;
        self.next_id += 1;
        let chain = self.chains.entry(key).or_default();
        let first = chain.is_empty();
        chain.push((id, handler));
        (id, first)
    }

    /// Remove the handler `id` from the chain for `key`.
    ///
    /// Returns true if this emptied the chain and the key was dropped
    /// (i.e. the bus-side match registration should be removed).
    pub fn remove(&mut self, key: &K, id: u64) -> bool {
        let Some(chain) = self.chains.get_mut(key) else {
            return false;
        };
        chain.retain(|(entry_id, _)| *entry_id != id);
        if chain.is_empty() {
            self.chains.remove(key);
            true
        } else {
            false
        }
    }

    /// Clone the chain for `key` in registration order.
    pub fn snapshot(&self, key: &K) -> Vec<H> {
        self.chains
            .get(key)
            .map(|chain| chain.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.chains.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
