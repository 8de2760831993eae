//! State replication: initial state, shared updates, equality suppression.

use futures::StreamExt;
use serde_json::json;
use statewire::{memory_link_pair, path, Channel, ChannelBuilder, Source, SourceOptions};
use statewire_test::{calculator, eventually, recording, MessageLog};

/// Connect one client to `source` over its own link, recording the server's
/// outbound wire traffic.
fn connect_recorded(source: Source) -> (Channel, MessageLog) {
    let (server_link, client_link) = memory_link_pair();
    let (server_link, log) = recording(server_link);
    tokio::spawn(statewire::serve(source, server_link, SourceOptions::new()));
    let (channel, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    (channel, log)
}

#[tokio::test]
async fn initial_state_arrives_with_readiness() {
    let (channel, _log) = connect_recorded(calculator());
    assert!(!channel.ready());
    channel.wait_ready().await.unwrap();
    assert_eq!(channel.state(), json!("a"));
}

#[tokio::test]
async fn two_channels_share_state_updates() {
    let source = calculator();
    let (first, _log1) = connect_recorded(source.clone());
    let (second, _log2) = connect_recorded(source);

    // Subscribe before the driver delivers anything so the event order is
    // fully observed: ready fires before the first state invocation.
    let mut first_states = first.subscribe("state");
    let mut second_states = second.subscribe("state");

    first.wait_ready().await.unwrap();
    second.wait_ready().await.unwrap();
    assert_eq!(first.state(), json!("a"));
    assert_eq!(second.state(), json!("a"));

    // The first state invocation carries the single-argument form.
    assert_eq!(first_states.next().await.unwrap(), vec![json!("a")]);
    assert_eq!(second_states.next().await.unwrap(), vec![json!("a")]);

    first
        .call(path(["set_state"]), vec![json!("b")])
        .await
        .unwrap();

    // Both channels observe one (new, old) update.
    assert_eq!(
        first_states.next().await.unwrap(),
        vec![json!("b"), json!("a")]
    );
    assert_eq!(
        second_states.next().await.unwrap(),
        vec![json!("b"), json!("a")]
    );
    assert_eq!(first.state(), json!("b"));
    assert_eq!(second.state(), json!("b"));
}

#[tokio::test]
async fn setting_an_equal_state_emits_no_message() {
    let source = calculator();
    let (channel, log) = connect_recorded(source.clone());
    channel.wait_ready().await.unwrap();

    let state_messages =
        || log.with_action(statewire::wire::source_action::STATE).len();
    eventually("initial state on the wire", move || state_messages() >= 1).await;

    // Same value: suppressed. Different value: one more STATE.
    source.set_state(json!("a")).unwrap();
    source.set_state(json!("z")).unwrap();
    let channel = channel.clone();
    eventually("state replicated", move || channel.state() == json!("z")).await;

    let states = log.with_action(statewire::wire::source_action::STATE);
    assert_eq!(states.len(), 2, "{states:?}");
}

#[tokio::test]
async fn state_updates_group_subscribers_on_one_link() {
    // Two channels on one link subscribed to the same source: the update
    // goes out as a single STATE addressed to both ids.
    let inner = calculator();
    let root_source = statewire::HandlerTree::new()
        .source("inner", inner.clone())
        .into_source(json!("root"))
        .unwrap();

    let (server_link, client_link) = memory_link_pair();
    let (server_link, log) = recording(server_link);
    tokio::spawn(statewire::serve(
        root_source,
        server_link,
        SourceOptions::new(),
    ));
    let (root, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    root.wait_ready().await.unwrap();

    let first = root.open(path(["inner"]), vec![]);
    let second = root.open(path(["inner"]), vec![]);
    first.wait_ready().await.unwrap();
    second.wait_ready().await.unwrap();

    inner.set_state(json!("grouped")).unwrap();
    let (a, b) = (first.clone(), second.clone());
    eventually("update replicated to both", move || {
        a.state() == json!("grouped") && b.state() == json!("grouped")
    })
    .await;

    let states = log.with_action(statewire::wire::source_action::STATE);
    let grouped = states
        .iter()
        .find(|message| message[2] == json!("grouped"))
        .unwrap();
    let ids = grouped[0].as_array().unwrap();
    assert_eq!(ids.len(), 2, "{states:?}");
}
