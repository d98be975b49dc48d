//! Integration tests for signal subscriptions and match-rule lifecycle.

mod support;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use dbus_courier::{ConnectionState, Error, Message, SignalMatchRule};

use support::*;

// =============================================================================
// Match-rule lifecycle on the bus
// =============================================================================

#[tokio::test]
async fn test_first_watch_sends_one_add_match() {
    let (connection, mut bus, _log) = open_connection().await;

    let (registration, add_match) = tokio::join!(
        connection.watch_signal("/a", "i.I", "S", |_msg: &Message| Ok(())),
        bus.serve_add_match(),
    );
    let registration = registration.unwrap();

    let (rule,): (String,) = add_match.body().deserialize().unwrap();
    assert_eq!(rule, SignalMatchRule::new("/a", "i.I", "S").rule_string());

    // A second subscription to the same rule needs no bus traffic.
    let second = connection
        .watch_signal("/a", "i.I", "S", |_msg: &Message| Ok(()))
        .await
        .unwrap();
    bus.ping_roundtrip().await;

    // Releasing one of two handlers keeps the match alive.
    registration.release();
    bus.ping_roundtrip().await;

    // Releasing the last one fires exactly one RemoveMatch.
    second.release();
    let remove_match = bus.next_sent().await;
    assert_eq!(remove_match.member(), Some("RemoveMatch"));
    let (rule,): (String,) = remove_match.body().deserialize().unwrap();
    assert_eq!(rule, SignalMatchRule::new("/a", "i.I", "S").rule_string());

    // Watching again after the chain emptied registers the match again.
    let (registration, add_match) = tokio::join!(
        connection.watch_signal("/a", "i.I", "S", |_msg: &Message| Ok(())),
        bus.serve_add_match(),
    );
    let _registration = registration.unwrap();
    let (rule,): (String,) = add_match.body().deserialize().unwrap();
    assert_eq!(rule, SignalMatchRule::new("/a", "i.I", "S").rule_string());
}

#[tokio::test]
async fn test_add_match_failure_rolls_back_the_registration() {
    let (connection, mut bus, _log) = open_connection().await;

    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    let serve = async {
        let request = bus.next_sent().await;
        assert_eq!(request.member(), Some("AddMatch"));
        let serial = bus.next_serial();
        let reply = Message::error_reply(&request, "org.freedesktop.DBus.Error.AccessDenied")
            .serial(serial)
            .body(&("denied".to_string(),))
            .unwrap()
            .build();
        bus.inject(reply);
    };
    let (result, ()) = tokio::join!(
        connection.watch_signal("/b", "i.I", "T", move |_msg: &Message| {
            *flag.lock() = true;
            Ok(())
        }),
        serve,
    );
    assert!(matches!(result.unwrap_err(), Error::ErrorReply(_, _)));

    // The rolled-back handler must not see matching signals.
    bus.inject(Message::signal("/b", "i.I", "T").serial(90).build());
    bus.ping_roundtrip().await;
    assert!(!*fired.lock());
}

#[tokio::test]
async fn test_dropping_a_registration_releases_it() {
    let (connection, mut bus, _log) = open_connection().await;

    {
        let (registration, _) = tokio::join!(
            connection.watch_signal("/a", "i.I", "S", |_msg: &Message| Ok(())),
            bus.serve_add_match(),
        );
        let _registration = registration.unwrap();
    }

    let remove_match = bus.next_sent().await;
    assert_eq!(remove_match.member(), Some("RemoveMatch"));
}

#[tokio::test]
async fn test_watching_signals_on_a_peer_skips_add_match() {
    let (connection, mut bus, _log) = open_peer_connection().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _registration = connection
        .watch_signal("/a", "i.I", "S", move |_msg: &Message| {
            let _ = tx.send(());
            Ok(())
        })
        .await
        .unwrap();

    bus.inject(Message::signal("/a", "i.I", "S").serial(5).build());
    rx.recv().await.unwrap();

    // No AddMatch ever went out; the barrier reply is the first frame.
    bus.ping_roundtrip().await;
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_signal_fan_out_preserves_registration_order() {
    let (connection, mut bus, _log) = open_connection().await;

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let record = order.clone();
    let notify = tx.clone();
    let (first, _) = tokio::join!(
        connection.watch_signal("/a", "i.I", "S", move |_msg: &Message| {
            record.lock().push(1);
            let _ = notify.send(());
            Ok(())
        }),
        bus.serve_add_match(),
    );
    let _first = first.unwrap();

    let record = order.clone();
    let notify = tx.clone();
    let _second = connection
        .watch_signal("/a", "i.I", "S", move |_msg: &Message| {
            record.lock().push(2);
            let _ = notify.send(());
            Ok(())
        })
        .await
        .unwrap();

    bus.inject(
        Message::signal("/a", "i.I", "S")
            .serial(50)
            .sender(":1.8")
            .build(),
    );
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    assert_eq!(order.lock().as_slice(), &[1, 2]);
}

#[tokio::test]
async fn test_signal_handler_sees_the_frame() {
    let (connection, mut bus, _log) = open_connection().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (registration, _) = tokio::join!(
        connection.watch_signal("/a", "i.I", "S", move |msg: &Message| {
            let _ = tx.send((
                msg.sender().unwrap_or("").to_string(),
                msg.body().deserialize::<u32>().unwrap_or(0),
            ));
            Ok(())
        }),
        bus.serve_add_match(),
    );
    let _registration = registration.unwrap();

    bus.inject(
        Message::signal("/a", "i.I", "S")
            .serial(51)
            .sender(":1.8")
            .body(&7u32)
            .unwrap()
            .build(),
    );
    let (sender, value) = rx.recv().await.unwrap();
    assert_eq!(sender, ":1.8");
    assert_eq!(value, 7);
}

#[tokio::test]
async fn test_unmatched_signal_is_ignored() {
    let (connection, mut bus, _log) = open_connection().await;

    bus.inject(Message::signal("/elsewhere", "i.Other", "X").serial(60).build());
    bus.ping_roundtrip().await;
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_signal_handler_error_tears_the_connection_down() {
    let (connection, mut bus, log) = open_connection().await;

    let (registration, _) = tokio::join!(
        connection.watch_signal("/a", "i.I", "S", |_msg: &Message| {
            Err(Error::InvalidArgument("handler bug".to_string()))
        }),
        bus.serve_add_match(),
    );
    let _registration = registration.unwrap();

    bus.inject(Message::signal("/a", "i.I", "S").serial(61).build());

    wait_for(|| log.lock().len() == 1).await;
    let reason = log.lock()[0].clone().expect("expected a disconnect reason");
    match &*reason {
        Error::InvalidOperation(text) => {
            assert!(text.contains("i.I.S"), "unexpected reason text: {text}");
        }
        other => panic!("expected InvalidOperation, got {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
