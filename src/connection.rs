//! The connection engine: facade, lifecycle, and inbound dispatch.
//!
//! A [`Connection`] owns one authenticated message stream plus every piece of
//! per-connection state: the serial allocator, the pending-reply table, the
//! subscription tables, and the method-handler table. Two background tasks do
//! the I/O: a writer draining the send queue and a receiver demultiplexing
//! inbound frames. All tables live under a single non-async mutex that is
//! never held across an await.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use zvariant::Type;

use crate::address::AddressEntry;
use crate::error::{Error, Result};
use crate::match_rules::{OwnerChangedMatchRule, SignalMatchRule};
use crate::message::{error_names, Message, MessageKind};
use crate::names::{
    ReleaseNameReply, RequestNameReply, ServiceNameRegistration, ServiceNameRegistry,
    NameCallback,
};
use crate::router::{NameOwnerHandler, RuleRouter, SignalHandler};
use crate::send_queue::{run_writer, PendingSend};
use crate::serial_map::{PendingReplies, SerialAllocator};
use crate::stream::{MessageStream, StreamConnector};

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Connection lifecycle states. Only forward transitions are valid;
/// `Disposed` is terminal and dominates `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}

/// Callback invoked exactly once when the connection goes down.
///
/// The reason is `None` for an explicit dispose.
pub type DisconnectHandler = Box<dyn FnOnce(Option<Arc<Error>>) + Send>;

/// Handler for inbound method calls on an exported object path.
///
/// The returned reply gets its `reply_serial` and destination filled in by
/// the connection before it is queued for send.
pub type MethodHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Message>> + Send + Sync>;

/// Which lifecycle phase a public operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
}

/// Everything guarded by the per-connection lock.
struct Tables {
    state: ConnectionState,
    disconnect_reason: Option<Arc<Error>>,
    pending: PendingReplies,
    signals: RuleRouter<SignalMatchRule, SignalHandler>,
    name_owners: RuleRouter<String, NameOwnerHandler>,
    names: ServiceNameRegistry,
    methods: HashMap<String, MethodHandler>,
    on_disconnect: Option<DisconnectHandler>,
    tasks: Vec<AbortHandle>,
}

struct Inner {
    serials: SerialAllocator,
    send_tx: mpsc::UnboundedSender<PendingSend>,
    stream: Mutex<Option<Arc<dyn MessageStream>>>,
    tables: Mutex<Tables>,
    /// Unique name from the `Hello` reply; empty when the remote is a plain
    /// peer rather than a bus daemon.
    local_name: OnceLock<String>,
}

/// A client-side D-Bus connection.
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection to the bus or peer at `address`.
    ///
    /// The entries of the address are tried in order; the first stream the
    /// connector opens wins, and the last connector error is propagated when
    /// none does. On success the `Hello` handshake has completed and the
    /// connection is in [`ConnectionState::Connected`].
    pub async fn open(
        address: &str,
        connector: &dyn StreamConnector,
        on_disconnect: DisconnectHandler,
    ) -> Result<Connection> {
        let entries = AddressEntry::parse_list(address)?;

        let mut last_err = None;
        let mut stream = None;
        for entry in &entries {
            match connector.connect(entry).await {
                Ok(s) => {
                    debug!(transport = %entry.transport(), "Opened message stream");
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(transport = %entry.transport(), error = %e, "Address entry failed");
                    last_err = Some(e);
                }
            }
        }
        let stream: Arc<dyn MessageStream> = match stream {
            Some(s) => Arc::from(s),
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    Error::InvalidArgument("no addresses in D-Bus address string".to_string())
                }))
            }
        };

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            serials: SerialAllocator::new(),
            send_tx,
            stream: Mutex::new(Some(stream.clone())),
            tables: Mutex::new(Tables {
                state: ConnectionState::Created,
                disconnect_reason: None,
                pending: PendingReplies::new(),
                signals: RuleRouter::new(),
                name_owners: RuleRouter::new(),
                names: ServiceNameRegistry::new(),
                methods: HashMap::new(),
                on_disconnect: None,
                tasks: Vec::new(),
            }),
            local_name: OnceLock::new(),
        });

        let writer = tokio::spawn(run_writer(stream.clone(), send_rx));
        let receiver = tokio::spawn(Inner::run_receiver(inner.clone(), stream));
        {
            let mut tables = inner.tables.lock();
            tables.state = ConnectionState::Connecting;
            tables.tasks.push(writer.abort_handle());
            tables.tasks.push(receiver.abort_handle());
        }

        let connection = Connection { inner };
        if let Err(e) = connection.hello().await {
            connection
                .inner
                .disconnect(ConnectionState::Disposed, None);
            return Err(e);
        }

        {
            let mut tables = connection.inner.tables.lock();
            if tables.state != ConnectionState::Connecting {
                return Err(Inner::terminal_error_locked(&tables));
            }
            tables.state = ConnectionState::Connected;
            tables.on_disconnect = Some(on_disconnect);
        }
        info!(
            local_name = connection.local_name().unwrap_or(""),
            remote_is_bus = connection.remote_is_bus(),
            "Connected"
        );
        Ok(connection)
    }

    /// The unique name the bus assigned to this connection, if the remote is
    /// a bus daemon.
    pub fn local_name(&self) -> Option<&str> {
        self.inner
            .local_name
            .get()
            .map(|n| n.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Whether the remote end is a bus daemon rather than a plain peer.
    pub fn remote_is_bus(&self) -> bool {
        self.inner.remote_is_bus()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.tables.lock().state
    }

    /// Send a method call and await its reply.
    ///
    /// An error reply from the remote surfaces as [`Error::ErrorReply`].
    pub async fn call(&self, msg: Message) -> Result<Message> {
        self.inner
            .call_message(msg, Phase::Connected, CancellationToken::new())
            .await
    }

    /// Like [`Connection::call`], cancellable through `cancel`.
    ///
    /// Cancelling before the frame is written drops it from the queue;
    /// cancelling afterwards abandons the reply, which is then quietly
    /// discarded on arrival.
    pub async fn call_with_cancel(
        &self,
        msg: Message,
        cancel: CancellationToken,
    ) -> Result<Message> {
        self.inner.call_message(msg, Phase::Connected, cancel).await
    }

    /// Queue a message that expects no reply, typically a signal.
    ///
    /// Never suspends; returns the serial assigned to the message.
    pub fn emit(&self, mut msg: Message) -> Result<u32> {
        {
            let tables = self.inner.tables.lock();
            self.inner.check_state(&tables, Phase::Connected)?;
        }
        let serial = self.inner.serials.next();
        msg.assign_serial(serial);
        let _ = self.inner.enqueue(msg, CancellationToken::new());
        Ok(serial)
    }

    /// Subscribe `handler` to signals matching `(path, interface, member)`.
    ///
    /// The first subscription for a rule registers the match with the bus
    /// daemon; releasing the returned registration drops the handler and, if
    /// it was the last one, removes the match again.
    pub async fn watch_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: impl Fn(&Message) -> Result<()> + Send + Sync + 'static,
    ) -> Result<SignalRegistration> {
        let rule = SignalMatchRule::new(path, interface, member);
        let handler: SignalHandler = Arc::new(handler);

        let (id, first) = {
            let mut tables = self.inner.tables.lock();
            self.inner.check_state(&tables, Phase::Connected)?;
            tables.signals.add(rule.clone(), handler)
        };

        if first && self.inner.remote_is_bus() {
            debug!(rule = %rule, "Registering signal match");
            if let Err(e) = self.inner.bus_call("AddMatch", &(rule.rule_string(),)).await {
                let mut tables = self.inner.tables.lock();
                tables.signals.remove(&rule, id);
                return Err(e);
            }
        }

        Ok(SignalRegistration {
            inner: Arc::downgrade(&self.inner),
            rule,
            id,
            released: false,
        })
    }

    /// Subscribe `handler` to ownership changes of the well-known name
    /// `service`.
    ///
    /// The handler receives `(old_owner, new_owner)`, with vanished owners
    /// normalized to `None`.
    pub async fn watch_name_owner(
        &self,
        service: &str,
        handler: impl Fn(Option<&str>, Option<&str>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<NameOwnerRegistration> {
        let handler: NameOwnerHandler = Arc::new(handler);

        let (id, first) = {
            let mut tables = self.inner.tables.lock();
            self.inner.check_state(&tables, Phase::Connected)?;
            if !self.inner.remote_is_bus() {
                return Err(Error::InvalidOperation(
                    "name owners can only be watched on a bus connection".to_string(),
                ));
            }
            tables.name_owners.add(service.to_string(), handler)
        };

        let rule = OwnerChangedMatchRule::new(service);
        if first {
            debug!(service = %service, "Registering name-owner match");
            if let Err(e) = self.inner.bus_call("AddMatch", &(rule.rule_string(),)).await {
                let mut tables = self.inner.tables.lock();
                tables.name_owners.remove(&service.to_string(), id);
                return Err(e);
            }
        }

        Ok(NameOwnerRegistration {
            inner: Arc::downgrade(&self.inner),
            service: service.to_string(),
            rule,
            id,
            released: false,
        })
    }

    /// Request ownership of the well-known name `name`.
    ///
    /// `flags` are the [`crate::names::request_name_flags`] bits. The
    /// callbacks fire on later `NameAcquired` / `NameLost` notifications for
    /// the name, posted to `dispatch` when one is given and inline on the
    /// receiver task otherwise. A name can only be requested once per
    /// connection until it is released.
    pub async fn request_name(
        &self,
        name: &str,
        flags: u32,
        on_acquire: Option<NameCallback>,
        on_lost: Option<NameCallback>,
        dispatch: Option<Handle>,
    ) -> Result<RequestNameReply> {
        {
            let mut tables = self.inner.tables.lock();
            self.inner.check_state(&tables, Phase::Connected)?;
            if !self.inner.remote_is_bus() {
                return Err(Error::InvalidOperation(
                    "names can only be requested from a bus".to_string(),
                ));
            }
            let registration = ServiceNameRegistration {
                on_acquire,
                on_lost,
                dispatch,
            };
            if !tables.names.insert(name, registration) {
                return Err(Error::InvalidOperation(format!(
                    "name {name:?} has already been requested on this connection"
                )));
            }
        }

        let result = self.inner.bus_call("RequestName", &(name, flags)).await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.tables.lock().names.remove(name);
                return Err(e);
            }
        };

        let code: u32 = match reply.body().deserialize() {
            Ok(code) => code,
            Err(e) => {
                self.inner.tables.lock().names.remove(name);
                return Err(e);
            }
        };
        let Some(code) = RequestNameReply::from_code(code) else {
            self.inner.tables.lock().names.remove(name);
            return Err(Error::Protocol(format!(
                "unknown RequestName reply code {code}"
            )));
        };

        // Not owned and not queued: the registration has nothing to wait for.
        if code == RequestNameReply::Exists {
            self.inner.tables.lock().names.remove(name);
        }
        debug!(name = %name, reply = ?code, "RequestName completed");
        Ok(code)
    }

    /// Release a name previously obtained through
    /// [`Connection::request_name`].
    ///
    /// Returns [`ReleaseNameReply::NotOwner`] without a bus round-trip when
    /// the name was never requested on this connection.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        {
            let mut tables = self.inner.tables.lock();
            self.inner.check_state(&tables, Phase::Connected)?;
            if tables.names.remove(name).is_none() {
                return Ok(ReleaseNameReply::NotOwner);
            }
        }

        let reply = self.inner.bus_call("ReleaseName", &(name,)).await?;
        let code: u32 = reply.body().deserialize()?;
        ReleaseNameReply::from_code(code).ok_or_else(|| {
            Error::Protocol(format!("unknown ReleaseName reply code {code}"))
        })
    }

    /// Export `handler` at `path`, replacing any previous handler there.
    pub fn add_method_handler(&self, path: &str, handler: MethodHandler) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        self.inner.check_state(&tables, Phase::Connected)?;
        tables.methods.insert(path.to_string(), handler);
        Ok(())
    }

    /// Remove the handler exported at `path`. Returns whether one existed.
    pub fn remove_method_handler(&self, path: &str) -> Result<bool> {
        let mut tables = self.inner.tables.lock();
        self.inner.check_state(&tables, Phase::Connected)?;
        Ok(tables.methods.remove(path).is_some())
    }

    /// Ask the bus for the current owner of `name`.
    ///
    /// Returns `None` when the name has no owner.
    pub async fn get_name_owner(&self, name: &str) -> Result<Option<String>> {
        match self.inner.bus_call("GetNameOwner", &(name,)).await {
            Ok(reply) => Ok(Some(reply.body().deserialize()?)),
            Err(Error::ErrorReply(error_name, _))
                if error_name == error_names::NAME_HAS_NO_OWNER =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the bus whether `name` currently has an owner.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let reply = self.inner.bus_call("NameHasOwner", &(name,)).await?;
        reply.body().deserialize()
    }

    /// List the names currently present on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.inner.bus_call("ListNames", &()).await?;
        reply.body().deserialize()
    }

    /// Tear the connection down.
    ///
    /// Idempotent and non-suspending: aborts the I/O tasks, drops the
    /// stream, fails every pending reply, clears every table, and fires the
    /// disconnect callback if it has not fired already.
    pub fn dispose(&self) {
        self.inner.disconnect(ConnectionState::Disposed, None);
    }

    async fn hello(&self) -> Result<()> {
        let msg = Message::method_call(DBUS_PATH, DBUS_INTERFACE, "Hello")
            .destination(DBUS_SERVICE)
            .build();
        let name = match self
            .inner
            .call_message(msg, Phase::Connecting, CancellationToken::new())
            .await
        {
            Ok(reply) => reply.body().deserialize::<String>()?,
            Err(Error::ErrorReply(error_name, _)) => {
                // The remote is a plain peer, not a bus daemon.
                debug!(error_name = %error_name, "Hello rejected; treating remote as a peer");
                String::new()
            }
            Err(e) => return Err(e),
        };
        let _ = self.inner.local_name.set(name);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.disconnect(ConnectionState::Disposed, None);
    }
}

impl Inner {
    fn remote_is_bus(&self) -> bool {
        self.local_name.get().map(|n| !n.is_empty()).unwrap_or(false)
    }

    /// Validate that the observed state allows an operation for `phase`.
    fn check_state(&self, tables: &Tables, phase: Phase) -> Result<()> {
        match tables.state {
            ConnectionState::Disposed => Err(Error::Disposed),
            ConnectionState::Disconnected => Err(Self::terminal_error_locked(tables)),
            ConnectionState::Created => Err(Error::NotConnected),
            ConnectionState::Connecting if phase == Phase::Connecting => Ok(()),
            ConnectionState::Connecting => Err(Error::Connecting),
            ConnectionState::Connected if phase == Phase::Connected => Ok(()),
            ConnectionState::Connected => Err(Error::AlreadyConnected),
        }
    }

    fn terminal_error_locked(tables: &Tables) -> Error {
        match (&tables.disconnect_reason, tables.state) {
            (Some(reason), ConnectionState::Disconnected) => {
                Error::Disconnected(reason.clone())
            }
            _ => Error::Disposed,
        }
    }

    fn terminal_error(&self) -> Error {
        Self::terminal_error_locked(&self.tables.lock())
    }

    /// Queue a frame for the writer; the returned slot resolves when it hits
    /// the wire, fails, or is dropped by cancellation or disconnect.
    fn enqueue(
        &self,
        message: Message,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, done_rx) = oneshot::channel();
        let entry = PendingSend {
            message,
            done,
            cancel,
        };
        if let Err(mpsc::error::SendError(entry)) = self.send_tx.send(entry) {
            let _ = entry.done.send(Err(self.terminal_error()));
        }
        done_rx
    }

    /// The full method-call path: assign a serial, park a reply slot, queue
    /// the frame, await transmission, then await the reply.
    async fn call_message(
        &self,
        mut msg: Message,
        phase: Phase,
        cancel: CancellationToken,
    ) -> Result<Message> {
        let serial = self.serials.next();
        msg.assign_serial(serial);

        let mut reply_rx = {
            let mut tables = self.tables.lock();
            self.check_state(&tables, phase)?;
            tables.pending.insert(serial)
        };

        let mut done_rx = self.enqueue(msg, cancel.clone());
        tokio::select! {
            sent = &mut done_rx => {
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        self.tables.lock().pending.remove(serial);
                        return Err(e);
                    }
                    Err(_) => {
                        self.tables.lock().pending.remove(serial);
                        return Err(self.terminal_error());
                    }
                }
            }
            _ = cancel.cancelled() => {
                // The writer resolves the slot either way; only an entry
                // that never reached the wire gets its reply slot removed.
                match done_rx.await {
                    Ok(Ok(())) => {}
                    _ => {
                        self.tables.lock().pending.remove(serial);
                    }
                }
                return Err(Error::Cancelled);
            }
        }

        let reply = tokio::select! {
            reply = &mut reply_rx => {
                match reply {
                    Ok(result) => result?,
                    Err(_) => return Err(self.terminal_error()),
                }
            }
            _ = cancel.cancelled() => {
                // Frame already sent: leave the slot so the late reply is
                // consumed instead of being treated as unexpected.
                return Err(Error::Cancelled);
            }
        };

        if reply.kind() == MessageKind::Error {
            let name = reply
                .error_name()
                .unwrap_or(error_names::FAILED)
                .to_string();
            let text = reply.body().deserialize::<String>().unwrap_or_default();
            return Err(Error::ErrorReply(name, text));
        }
        Ok(reply)
    }

    /// Call a `org.freedesktop.DBus` bus-daemon method.
    async fn bus_call<B: Serialize + Type>(&self, member: &str, body: &B) -> Result<Message> {
        let msg = Message::method_call(DBUS_PATH, DBUS_INTERFACE, member)
            .destination(DBUS_SERVICE)
            .body(body)?
            .build();
        self.call_message(msg, Phase::Connected, CancellationToken::new())
            .await
    }

    /// Queue a frame without waiting on its completion slot.
    fn send_detached(&self, mut msg: Message) {
        msg.assign_serial(self.serials.next());
        let _ = self.enqueue(msg, CancellationToken::new());
    }

    /// Fire-and-forget `RemoveMatch`; failures are logged, never surfaced.
    fn spawn_remove_match(self: &Arc<Self>, rule: String) {
        let inner = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = inner.bus_call("RemoveMatch", &(rule.clone(),)).await {
                debug!(rule = %rule, error = %e, "RemoveMatch failed");
            }
        });
        let mut tables = self.tables.lock();
        tables.tasks.retain(|t| !t.is_finished());
        tables.tasks.push(task.abort_handle());
    }

    async fn run_receiver(self: Arc<Self>, stream: Arc<dyn MessageStream>) {
        let reason = loop {
            match stream.recv().await {
                Ok(Some(msg)) => {
                    if let Err(e) = self.dispatch(msg).await {
                        break Arc::new(e);
                    }
                }
                Ok(None) => {
                    break Arc::new(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed by peer",
                    )))
                }
                Err(e) => break Arc::new(Error::Io(e)),
            }
        };
        debug!(reason = %reason, "Receiver loop terminated");
        self.disconnect(ConnectionState::Disconnected, Some(reason));
    }

    /// Route one inbound frame by kind.
    async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<()> {
        if let Some(reply_serial) = msg.reply_serial() {
            let slot = self.tables.lock().pending.remove(reply_serial);
            return match slot {
                Some(slot) => {
                    // A dropped receiver means the caller went away; the
                    // reply is discarded.
                    let _ = slot.send(Ok(msg));
                    Ok(())
                }
                None => Err(Error::Protocol(format!(
                    "unexpected reply to serial {reply_serial}"
                ))),
            };
        }

        match msg.kind() {
            MessageKind::MethodCall => self.dispatch_method_call(msg).await,
            MessageKind::Signal => self.dispatch_signal(&msg),
            MessageKind::MethodReturn => Err(Error::Protocol(
                "method return without a reply serial".to_string(),
            )),
            MessageKind::Error => Err(Error::Protocol(
                "error message without a reply serial".to_string(),
            )),
            MessageKind::Invalid => {
                Err(Error::Protocol("message of invalid kind".to_string()))
            }
        }
    }

    fn dispatch_signal(&self, msg: &Message) -> Result<()> {
        if let Some(rule) = SignalMatchRule::from_message(msg) {
            let chain = self.tables.lock().signals.snapshot(&rule);
            for handler in chain {
                handler(msg).map_err(|e| {
                    Error::InvalidOperation(format!(
                        "signal handler for {}.{} failed: {e}",
                        rule.interface, rule.member
                    ))
                })?;
            }
        }

        if msg.interface() == Some(DBUS_INTERFACE) {
            match msg.member() {
                Some("NameOwnerChanged") => return self.handle_name_owner_changed(msg),
                Some("NameAcquired") => return self.handle_name_notification(msg, true),
                Some("NameLost") => return self.handle_name_notification(msg, false),
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_name_owner_changed(&self, msg: &Message) -> Result<()> {
        let (name, old_owner, new_owner): (String, String, String) =
            match msg.body().deserialize() {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!(error = %e, "Malformed NameOwnerChanged body");
                    return Ok(());
                }
            };

        let chain = self.tables.lock().name_owners.snapshot(&name);
        if chain.is_empty() {
            return Ok(());
        }
        trace!(name = %name, old = %old_owner, new = %new_owner, "Name owner changed");
        let old = (!old_owner.is_empty()).then_some(old_owner.as_str());
        let new = (!new_owner.is_empty()).then_some(new_owner.as_str());
        for handler in chain {
            handler(old, new).map_err(|e| {
                Error::InvalidOperation(format!(
                    "name-owner handler for {name:?} failed: {e}"
                ))
            })?;
        }
        Ok(())
    }

    fn handle_name_notification(&self, msg: &Message, acquired: bool) -> Result<()> {
        let name: String = match msg.body().deserialize() {
            Ok(name) => name,
            Err(e) => {
                debug!(error = %e, "Malformed name notification body");
                return Ok(());
            }
        };
        let registration = self.tables.lock().names.get(&name);
        if let Some(registration) = registration {
            debug!(name = %name, acquired = acquired, "Name notification");
            if acquired {
                registration.notify_acquired(&name);
            } else {
                registration.notify_lost(&name);
            }
        }
        Ok(())
    }

    async fn dispatch_method_call(&self, msg: Message) -> Result<()> {
        if msg.interface() == Some(PEER_INTERFACE) {
            return self.handle_peer_call(&msg);
        }

        let handler = msg
            .path()
            .and_then(|path| self.tables.lock().methods.get(path).cloned());

        match handler {
            Some(handler) => {
                let call = msg.clone();
                let mut reply = match handler(call).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        if !msg.reply_expected() {
                            return Ok(());
                        }
                        warn!(path = msg.path().unwrap_or(""), error = %e, "Method handler failed");
                        Message::error_reply(&msg, error_names::FAILED)
                            .body(&(e.to_string(),))?
                            .build()
                    }
                };
                if !msg.reply_expected() {
                    return Ok(());
                }
                reply.set_reply_serial(Some(msg.serial()));
                reply.set_destination(msg.sender().map(str::to_string));
                self.send_detached(reply);
                Ok(())
            }
            None => {
                if !msg.reply_expected() {
                    return Ok(());
                }
                let description = format!(
                    "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
                    msg.member().unwrap_or(""),
                    msg.body().signature().unwrap_or(""),
                    msg.interface().unwrap_or("")
                );
                debug!(path = msg.path().unwrap_or(""), "Unbound method call");
                let reply = Message::error_reply(&msg, error_names::UNKNOWN_METHOD)
                    .body(&(description,))?
                    .build();
                self.send_detached(reply);
                Ok(())
            }
        }
    }

    /// Built-in responder for `org.freedesktop.DBus.Peer`.
    fn handle_peer_call(&self, msg: &Message) -> Result<()> {
        match msg.member() {
            Some("Ping") => {
                if msg.reply_expected() {
                    self.send_detached(Message::method_return(msg).build());
                }
                Ok(())
            }
            Some("GetMachineId") => {
                if msg.reply_expected() {
                    let reply = Message::method_return(msg)
                        .body(&machine_id().to_string())?
                        .build();
                    self.send_detached(reply);
                }
                Ok(())
            }
            member => {
                if msg.reply_expected() {
                    let description = format!(
                        "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
                        member.unwrap_or(""),
                        msg.body().signature().unwrap_or(""),
                        PEER_INTERFACE
                    );
                    let reply = Message::error_reply(msg, error_names::UNKNOWN_METHOD)
                        .body(&(description,))?
                        .build();
                    self.send_detached(reply);
                }
                Ok(())
            }
        }
    }

    /// Idempotent teardown. `Disposed` dominates `Disconnected`; a second
    /// call can only upgrade the state, everything else already happened.
    fn disconnect(&self, next_state: ConnectionState, reason: Option<Arc<Error>>) {
        let (pending, callback, tasks, stream) = {
            let mut tables = self.tables.lock();
            match tables.state {
                ConnectionState::Disposed => return,
                ConnectionState::Disconnected => {
                    if next_state == ConnectionState::Disposed {
                        tables.state = ConnectionState::Disposed;
                    }
                    return;
                }
                _ => {}
            }
            tables.state = next_state;
            tables.disconnect_reason = reason.clone();

            let pending = tables.pending.drain();
            tables.signals.clear();
            tables.name_owners.clear();
            tables.names.clear();
            tables.methods.clear();
            let callback = tables.on_disconnect.take();
            let tasks = std::mem::take(&mut tables.tasks);
            (pending, callback, tasks, self.stream.lock().take())
        };

        for task in tasks {
            task.abort();
        }
        drop(stream);

        debug!(
            state = ?next_state,
            reason = ?reason,
            pending = pending.len(),
            "Connection torn down"
        );
        for slot in pending {
            let error = match &reason {
                Some(reason) => Error::Disconnected(reason.clone()),
                None => Error::Disposed,
            };
            let _ = slot.send(Err(error));
        }

        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// A signal subscription held by a caller.
///
/// Releasing (or dropping) it removes the handler; the last handler for a
/// rule also removes the bus-side match, fire-and-forget.
#[derive(Debug)]
pub struct SignalRegistration {
    inner: Weak<Inner>,
    rule: SignalMatchRule,
    id: u64,
    released: bool,
}

impl SignalRegistration {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let emptied = inner.tables.lock().signals.remove(&self.rule, self.id);
        if emptied && inner.remote_is_bus() {
            inner.spawn_remove_match(self.rule.rule_string());
        }
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// A name-owner subscription held by a caller.
#[derive(Debug)]
pub struct NameOwnerRegistration {
    inner: Weak<Inner>,
    service: String,
    rule: OwnerChangedMatchRule,
    id: u64,
    released: bool,
}

impl NameOwnerRegistration {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let emptied = inner.tables.lock().name_owners.remove(&self.service, self.id);
        if emptied {
            inner.spawn_remove_match(self.rule.rule_string());
        }
    }
}

impl Drop for NameOwnerRegistration {
    fn drop(&mut self) {
        self.release_inner();
    }
}

static MACHINE_ID: OnceLock<String> = OnceLock::new();

/// The stable per-machine UUID reported by `GetMachineId`.
fn machine_id() -> &'static str {
    MACHINE_ID.get_or_init(|| {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(path) {
                let id = id.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
        Uuid::new_v4().simple().to_string()
    })
}
