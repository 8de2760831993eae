//! Lifecycle: id conflicts, timeouts, close idempotence, link teardown,
//! channel limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::json;
use statewire::wire::{client_action, source_action};
use statewire::{
    memory_link_pair, path, ChannelBuilder, ChannelId, Error, HandlerTree, Link, LinkChannels,
    LinkEvent, MemoryLink, SourceMessage, SourceOptions, Value, WireMessage,
};
use statewire_test::{calculator, eventually, recording};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Drive the client half of a link by hand, message by message.
struct RawClient {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

fn raw_client(link: MemoryLink) -> RawClient {
    let (out_tx, out_rx) = mpsc::unbounded();
    let (in_tx, in_rx) = mpsc::unbounded();
    tokio::spawn(Box::new(link).run(LinkChannels {
        outgoing_rx: out_rx,
        incoming_tx: in_tx,
    }));
    RawClient {
        tx: out_tx,
        rx: in_rx,
    }
}

impl RawClient {
    fn send(&self, message: WireMessage) {
        self.tx.unbounded_send(message).unwrap();
    }

    async fn next_message(&mut self) -> SourceMessage {
        match self.rx.next().await {
            Some(LinkEvent::Message(raw)) => {
                SourceMessage::decode(&raw).unwrap_or_else(|| panic!("bad message: {raw:?}"))
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }
}

fn reason_message(reason: &Value) -> String {
    Error::from_value(reason).message
}

#[tokio::test]
async fn reused_channel_id_closes_prior_and_rejects_newcomer() {
    init_tracing();
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(
        calculator(),
        server_link,
        SourceOptions::new(),
    ));
    let mut client = raw_client(client_link);

    client.send(vec![json!("7")]);
    match client.next_message().await {
        SourceMessage::State { channels, value } => {
            assert_eq!(channels, vec![ChannelId::from("7")]);
            assert_eq!(value, json!("a"));
        }
        other => panic!("expected the initial state, got {other:?}"),
    }

    // Same id again, while the first channel is still live: the prior is
    // closed and the newcomer rejected, both with the conflict reason.
    client.send(vec![json!("7")]);
    for _ in 0..2 {
        match client.next_message().await {
            SourceMessage::Close { channels, reason } => {
                assert_eq!(channels, vec![ChannelId::from("7")]);
                assert_eq!(reason_message(&reason), "channel id conflict");
            }
            other => panic!("expected a close, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn colliding_id_generator_surfaces_the_conflict_on_both_handles() {
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(
        statewire_test::with_nested(),
        server_link,
        SourceOptions::new(),
    ));
    let (root, driver) = ChannelBuilder::new()
        .channel_id_generator(|| ChannelId::from("7"))
        .connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    // The nested open reuses "7"; the root is the prior and loses.
    let nested = root.open(path(["inner"]), vec![]);
    let error = nested.wait_ready().await.unwrap_err();
    assert_eq!(error.message, "channel id conflict");
    assert!(root.closed());
    assert_eq!(
        reason_message(&root.close_reason().unwrap()),
        "channel id conflict"
    );
}

#[tokio::test]
async fn connection_timeout_closes_a_pending_root() {
    // No server behind the link: hold the other half so nothing answers.
    let (_server_link, client_link) = memory_link_pair();
    let (root, driver) = ChannelBuilder::new()
        .connection_timeout(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            json!("timeout")
        })
        .connect(client_link);
    tokio::spawn(driver);

    let errors = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    root.on("error", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = Arc::clone(&closes);
    root.on("close", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let error = root.wait_ready().await.unwrap_err();
    assert_eq!(error.message, "timeout");
    assert_eq!(root.close_reason(), Some(json!("timeout")));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // Pending calls of the closed root reject with the same reason.
    let error = root.call(path(["sum"]), vec![]).await.unwrap_err();
    assert_eq!(error.message, "timeout");
}

#[tokio::test]
async fn connection_timeout_never_touches_a_ready_channel() {
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(
        calculator(),
        server_link,
        SourceOptions::new(),
    ));
    let (root, driver) = ChannelBuilder::new()
        .connection_timeout(async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            json!("timeout")
        })
        .connect(client_link);
    tokio::spawn(driver);

    root.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!root.closed());
    let result = root.call(path(["sum"]), vec![json!(1), json!(2)]).await;
    assert_eq!(result.unwrap(), json!(3));
}

#[tokio::test]
async fn repeated_close_sends_one_wire_message() {
    let (server_link, client_link) = memory_link_pair();
    let (client_link, log) = recording(client_link);
    tokio::spawn(statewire::serve(
        calculator(),
        server_link,
        SourceOptions::new(),
    ));
    let (root, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    root.on("close", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    root.close(json!("bye"));
    root.close(json!("bye again"));
    root.close(json!("still here?"));

    let log_probe = log.clone();
    eventually("close reaches the wire", move || {
        !log_probe.with_action(client_action::CLOSE).is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.with_action(client_action::CLOSE).len(), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(root.close_reason(), Some(json!("bye")));
}

#[tokio::test]
async fn repeated_dispose_sends_one_close_per_subscriber() {
    let source = calculator();
    let (server_link, client_link) = memory_link_pair();
    let (server_link, log) = recording(server_link);
    tokio::spawn(statewire::serve(
        source.clone(),
        server_link,
        SourceOptions::new(),
    ));
    let (root, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    source.dispose(json!("gone"));
    source.dispose(json!("gone twice"));

    let observer = root.clone();
    eventually("client closed by dispose", move || observer.closed()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.with_action(source_action::CLOSE).len(), 1);
}

#[tokio::test]
async fn link_teardown_closes_channels_and_rejects_pending_calls() {
    let source = HandlerTree::new()
        .method("never", |_cx, _args| async {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .into_source(json!(null))
        .unwrap();

    let (server_link, client_link) = memory_link_pair();
    let server = tokio::spawn(statewire::serve(source, server_link, SourceOptions::new()));
    let (root, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    let hanging = root.call(path(["never"]), vec![]);
    // Tear the link down from the server side while the call is in flight.
    server.abort();

    let error = hanging.await.unwrap_err();
    assert_eq!(error.message, "connection closed");
    let observer = root.clone();
    eventually("root closed by link teardown", move || observer.closed()).await;
}

#[tokio::test]
async fn channel_limit_rejects_additional_channels() {
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(
        statewire_test::with_nested(),
        server_link,
        SourceOptions::new().max_channels(1),
    ));
    let (root, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    let nested = root.open(path(["inner"]), vec![]);
    let error = nested.wait_ready().await.unwrap_err();
    assert_eq!(error.message, "channels limit");
    assert!(root.ready() && !root.closed());
}

#[tokio::test]
async fn messages_for_unknown_channels_are_answered_with_closes() {
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(
        calculator(),
        server_link,
        SourceOptions::new(),
    ));
    let mut client = raw_client(client_link);

    // A call on a channel that was never initialized.
    client.send(vec![json!("x"), json!(client_action::CALL), json!(1), json!([]), json!([])]);
    match client.next_message().await {
        SourceMessage::Close { channels, reason } => {
            assert_eq!(channels, vec![ChannelId::from("x")]);
            assert_eq!(reason_message(&reason), "wrong channel");
        }
        other => panic!("expected a close, got {other:?}"),
    }

    // Channel creation through an unknown parent closes both ids.
    client.send(vec![
        json!("x"),
        json!(client_action::CREATE),
        json!("y"),
        json!([]),
        json!([]),
    ]);
    let mut closed = Vec::new();
    for _ in 0..2 {
        match client.next_message().await {
            SourceMessage::Close { channels, .. } => closed.extend(channels),
            other => panic!("expected a close, got {other:?}"),
        }
    }
    assert_eq!(closed, vec![ChannelId::from("x"), ChannelId::from("y")]);

    // Short and malformed messages are ignored outright.
    client.send(vec![]);
    client.send(vec![json!("x"), json!(99)]);
    client.send(vec![json!("7")]);
    match client.next_message().await {
        SourceMessage::State { .. } => {}
        other => panic!("expected the initial state, got {other:?}"),
    }
}
