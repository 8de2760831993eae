//! Event routing: canonical keys, broadcast and per-channel delivery,
//! ordering against state updates.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::json;
use statewire::{
    memory_link_pair, path, Channel, ChannelBuilder, Source, SourceChannel, SourceOptions,
};
use statewire_test::{calculator, eventually};

async fn connect(source: Source) -> Channel {
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(source, server_link, SourceOptions::new()));
    let (channel, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);
    channel
}

#[tokio::test]
async fn events_broadcast_to_every_subscriber() {
    let source = calculator();
    let first = connect(source.clone()).await;
    let second = connect(source.clone()).await;
    let mut first_ticks = first.subscribe(["tick"]);
    let mut second_ticks = second.subscribe(["tick"]);
    first.wait_ready().await.unwrap();
    second.wait_ready().await.unwrap();

    source.emit(path(["tick"]), vec![json!(7)]).unwrap();
    assert_eq!(first_ticks.next().await.unwrap(), vec![json!(7)]);
    assert_eq!(second_ticks.next().await.unwrap(), vec![json!(7)]);
}

#[tokio::test]
async fn numeric_segments_share_their_string_key() {
    let source = calculator();
    let channel = connect(source.clone()).await;
    let mut rows = channel.subscribe(path([
        statewire::Segment::from("row"),
        statewire::Segment::from(1i64),
    ]));
    channel.wait_ready().await.unwrap();

    // Emitted with a string segment, received by the numeric subscription.
    source
        .emit(path(["row", "1"]), vec![json!("cell")])
        .unwrap();
    assert_eq!(rows.next().await.unwrap(), vec![json!("cell")]);
}

#[tokio::test]
async fn a_user_event_named_state_does_not_collide_with_the_builtin() {
    let source = calculator();
    let channel = connect(source.clone()).await;
    let mut custom = channel.subscribe(["state"]);
    let mut builtin = channel.subscribe("state");
    channel.wait_ready().await.unwrap();

    // The built-in fires for the initial state only so far.
    assert_eq!(builtin.next().await.unwrap(), vec![json!("a")]);

    source.emit(path(["state"]), vec![json!("custom")]).unwrap();
    assert_eq!(custom.next().await.unwrap(), vec![json!("custom")]);

    // No state update happened, so the built-in stream stays quiet.
    source.set_state(json!("b")).unwrap();
    assert_eq!(builtin.next().await.unwrap(), vec![json!("b"), json!("a")]);
}

#[tokio::test]
async fn channel_emit_reaches_only_its_own_channel() {
    let (channels_tx, mut channels_rx) = futures::channel::mpsc::unbounded::<SourceChannel>();
    let options = SourceOptions::new()
        .context(json!({"link": "one"}))
        .on_channel(move |channel, _parent| {
            let _ = channels_tx.unbounded_send(channel.clone());
        });

    let source = calculator();
    let (server_link, client_link) = memory_link_pair();
    tokio::spawn(statewire::serve(source.clone(), server_link, options));
    let (first, driver) = ChannelBuilder::new().connect(client_link);
    tokio::spawn(driver);

    let second = connect(source).await;
    let mut first_private = first.subscribe(["private"]);
    let mut second_private = second.subscribe(["private"]);
    first.wait_ready().await.unwrap();
    second.wait_ready().await.unwrap();

    let server_channel = channels_rx.next().await.unwrap();
    server_channel.wait_ready().await.unwrap();
    // The hook's channel carries the link context.
    assert_eq!(server_channel.context(), json!({"link": "one"}));

    server_channel
        .emit(path(["private"]), vec![json!("whisper")])
        .unwrap();
    assert_eq!(first_private.next().await.unwrap(), vec![json!("whisper")]);

    // The other subscriber of the same source hears nothing.
    assert!(second_private.try_next().is_err());
}

#[tokio::test]
async fn state_and_events_interleave_in_emission_order() {
    let source = calculator();
    let channel = connect(source.clone()).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    channel.on("state", move |args| {
        sink.lock().unwrap().push(format!("state:{}", args[0]));
        Ok(())
    });
    let sink = Arc::clone(&log);
    channel.on(["tick"], move |args| {
        sink.lock().unwrap().push(format!("tick:{}", args[0]));
        Ok(())
    });
    channel.wait_ready().await.unwrap();

    source.set_state(json!("s1")).unwrap();
    source.emit(path(["tick"]), vec![json!(1)]).unwrap();
    source.set_state(json!("s2")).unwrap();

    let probe = Arc::clone(&log);
    eventually("all four entries observed", move || {
        probe.lock().unwrap().len() == 4
    })
    .await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "state:\"a\"".to_string(),
            "state:\"s1\"".to_string(),
            "tick:1".to_string(),
            "state:\"s2\"".to_string(),
        ]
    );
}
