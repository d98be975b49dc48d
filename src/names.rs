//! Client-side service-name registry.
//!
//! Tracks the well-known names this connection has requested from the bus
//! daemon, together with the callbacks to fire when the daemon notifies us
//! through `NameAcquired` / `NameLost`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;

/// Request-name flags (from the D-Bus spec).
pub mod request_name_flags {
    /// Allow replacement of this owner by another connection.
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    /// Attempt to replace the existing owner if possible.
    pub const REPLACE_EXISTING: u32 = 0x2;
    /// Don't queue if the name is already owned - return immediately.
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Reply codes for `RequestName` (from the D-Bus spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    /// Caller is now the primary owner of the name.
    PrimaryOwner = 1,
    /// Caller is in queue waiting for the name.
    InQueue = 2,
    /// Name is already owned and DO_NOT_QUEUE was specified.
    Exists = 3,
    /// Caller was already the primary owner of the name.
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// Reply codes for `ReleaseName` (from the D-Bus spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    /// Caller has released the name successfully.
    Released = 1,
    /// The name does not exist (was not owned by anyone).
    NonExistent = 2,
    /// The caller is not the owner of this name.
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}

/// Callback fired with the name on `NameAcquired` / `NameLost`.
pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A well-known name this connection has requested.
pub(crate) struct ServiceNameRegistration {
    pub on_acquire: Option<NameCallback>,
    pub on_lost: Option<NameCallback>,
    /// Runtime to post the callbacks to; inline on the receiver task if
    /// absent.
    pub dispatch: Option<Handle>,
}

impl ServiceNameRegistration {
    pub fn notify_acquired(&self, name: &str) {
        if let Some(cb) = &self.on_acquire {
            dispatch(cb.clone(), self.dispatch.as_ref(), name);
        }
    }

    pub fn notify_lost(&self, name: &str) {
        if let Some(cb) = &self.on_lost {
            dispatch(cb.clone(), self.dispatch.as_ref(), name);
        }
    }
}

fn dispatch(cb: NameCallback, handle: Option<&Handle>, name: &str) {
    match handle {
        Some(handle) => {
            let name = name.to_string();
            handle.spawn(async move { cb(&name) });
        }
        None => cb(name),
    }
}

/// Registrations keyed by well-known name.
#[derive(Default)]
pub(crate) struct ServiceNameRegistry {
    entries: HashMap<String, Arc<ServiceNameRegistration>>,
}

impl ServiceNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration. Returns false if the name is already
    /// registered on this connection.
    pub fn insert(&mut self, name: &str, registration: ServiceNameRegistration) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries
            .insert(name.to_string(), Arc::new(registration));
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<ServiceNameRegistration>> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceNameRegistration>> {
        self.entries.get(name).cloned()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
