//! In-memory message stream and scripted bus for the integration suites.
//!
//! `pair()` hands back a connector for `Connection::open` plus a `BusHandle`
//! the test drives: it observes every frame the engine writes, injects
//! inbound frames, and can close or fail the stream at will.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use zvariant::Type;

use dbus_courier::address::AddressEntry;
use dbus_courier::connection::Connection;
use dbus_courier::message::Message;
use dbus_courier::stream::{MessageStream, StreamConnector};
use dbus_courier::{Error, Result};

type InboundEvent = io::Result<Option<Message>>;

/// The engine's end of the in-memory stream pair.
pub struct MockStream {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
    write_failures: Arc<Mutex<Vec<io::ErrorKind>>>,
}

#[async_trait]
impl MessageStream for MockStream {
    async fn send(&self, msg: &Message) -> io::Result<()> {
        if let Some(kind) = self.write_failures.lock().pop() {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        self.outbound
            .send(msg.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"))
    }

    async fn recv(&self) -> io::Result<Option<Message>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(event) => event,
            // Test dropped its handle: orderly close.
            None => Ok(None),
        }
    }
}

/// Connector whose `fail:` transport always errors and whose other
/// transports hand out the prepared stream.
pub struct MockConnector {
    stream: Mutex<Option<MockStream>>,
    pub attempts: AtomicUsize,
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, entry: &AddressEntry) -> Result<Box<dyn MessageStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if entry.transport() == "fail" {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "transport unavailable",
            )));
        }
        let stream = self
            .stream
            .lock()
            .take()
            .expect("mock connector can only open one stream");
        Ok(Box::new(stream))
    }
}

/// Test-side handle driving the scripted bus.
pub struct BusHandle {
    sent: mpsc::UnboundedReceiver<Message>,
    inject_tx: mpsc::UnboundedSender<InboundEvent>,
    write_failures: Arc<Mutex<Vec<io::ErrorKind>>>,
    serial: u32,
}

impl BusHandle {
    /// The next frame the engine wrote, in wire order.
    pub async fn next_sent(&mut self) -> Message {
        timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("stream closed while waiting for an outbound frame")
    }

    /// Deliver an inbound frame to the engine.
    pub fn inject(&self, msg: Message) {
        let _ = self.inject_tx.send(Ok(Some(msg)));
    }

    /// Close the stream from the remote side.
    pub fn close(&self) {
        let _ = self.inject_tx.send(Ok(None));
    }

    /// Fail the engine's next read.
    pub fn fail(&self, kind: io::ErrorKind) {
        let _ = self
            .inject_tx
            .send(Err(io::Error::new(kind, "injected read failure")));
    }

    /// Fail the engine's next write.
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.write_failures.lock().push(kind);
    }

    /// Allocate a serial for a bus-originated frame.
    pub fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    /// Build a method return for `request` with a fresh bus serial.
    pub fn reply_to<B: Serialize + Type>(&mut self, request: &Message, body: &B) -> Message {
        let serial = self.next_serial();
        Message::method_return(request)
            .serial(serial)
            .body(body)
            .expect("failed to encode reply body")
            .build()
    }

    /// Serve the `Hello` handshake, assigning `unique` as the connection's
    /// name. Returns the Hello frame for inspection.
    pub async fn serve_hello(&mut self, unique: &str) -> Message {
        let call = self.next_sent().await;
        assert_eq!(call.member(), Some("Hello"));
        let reply = self.reply_to(&call, &unique.to_string());
        self.inject(reply);
        call
    }

    /// Serve one `AddMatch` with an empty success reply. Returns the
    /// `AddMatch` frame for inspection.
    pub async fn serve_add_match(&mut self) -> Message {
        let call = self.next_sent().await;
        assert_eq!(call.member(), Some("AddMatch"));
        let reply = self.reply_to(&call, &());
        self.inject(reply);
        call
    }

    /// Inject a Peer `Ping` and await its reply.
    ///
    /// Doubles as an ordering barrier: the reply being the next outbound
    /// frame proves nothing else was queued before it, and the round-trip
    /// proves the connection is still alive.
    pub async fn ping_roundtrip(&mut self) {
        let serial = self.next_serial();
        let ping = Message::method_call("/", "org.freedesktop.DBus.Peer", "Ping")
            .serial(serial)
            .sender(":0.bus")
            .build();
        self.inject(ping);
        let reply = self.next_sent().await;
        assert_eq!(
            reply.reply_serial(),
            Some(serial),
            "expected the Ping reply, got {reply:?}"
        );
    }
}

static TRACING: Once = Once::new();

/// Route engine logs into the test output; `RUST_LOG` filters as usual.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a connector/bus pair sharing one in-memory stream.
pub fn pair() -> (MockConnector, BusHandle) {
    init_tracing();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inject_tx, inject_rx) = mpsc::unbounded_channel();
    let write_failures = Arc::new(Mutex::new(Vec::new()));

    let stream = MockStream {
        outbound: outbound_tx,
        inbound: tokio::sync::Mutex::new(inject_rx),
        write_failures: write_failures.clone(),
    };
    let connector = MockConnector {
        stream: Mutex::new(Some(stream)),
        attempts: AtomicUsize::new(0),
    };
    let bus = BusHandle {
        sent: outbound_rx,
        inject_tx,
        write_failures,
        serial: 0,
    };
    (connector, bus)
}

/// Every reason the disconnect callback has been invoked with.
pub type DisconnectLog = Arc<Mutex<Vec<Option<Arc<Error>>>>>;

pub fn disconnect_log() -> (DisconnectLog, dbus_courier::DisconnectHandler) {
    let log: DisconnectLog = Arc::new(Mutex::new(Vec::new()));
    let writer = log.clone();
    (log, Box::new(move |reason| writer.lock().push(reason)))
}

/// Open a connection against a scripted bus that grants the unique name
/// `:1.42`.
pub async fn open_connection() -> (Connection, BusHandle, DisconnectLog) {
    let (connector, mut bus) = pair();
    let (log, handler) = disconnect_log();
    let (connection, _hello) = tokio::join!(
        Connection::open("mock:", &connector, handler),
        bus.serve_hello(":1.42"),
    );
    (connection.expect("open failed"), bus, log)
}

/// Open a connection against a remote that rejects `Hello`, i.e. a plain
/// peer rather than a bus daemon.
pub async fn open_peer_connection() -> (Connection, BusHandle, DisconnectLog) {
    let (connector, mut bus) = pair();
    let (log, handler) = disconnect_log();
    let serve = async {
        let call = bus.next_sent().await;
        assert_eq!(call.member(), Some("Hello"));
        let serial = bus.next_serial();
        let reply = Message::error_reply(&call, "org.freedesktop.DBus.Error.UnknownMethod")
            .serial(serial)
            .body(&("no bus here".to_string(),))
            .expect("failed to encode error body")
            .build();
        bus.inject(reply);
    };
    let (connection, ()) = tokio::join!(
        Connection::open("mock:", &connector, handler),
        serve,
    );
    (connection.expect("open failed"), bus, log)
}

/// A method call addressed at a generic remote service.
pub fn sample_call(member: &str) -> Message {
    Message::method_call("/org/example/Object", "org.example.Iface", member)
        .destination("org.example.Service")
        .build()
}

/// Poll `cond` until it holds or a generous timeout elapses.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
