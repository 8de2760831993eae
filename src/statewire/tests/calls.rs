//! Call dispatch: requests, notifies, and the response rules around them.

use futures::future::BoxFuture;
use serde_json::json;
use statewire::{
    memory_link_pair, path, Channel, ChannelBuilder, Error, Handler, Outcome, Source,
    SourceChannel, SourceOptions, Value,
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
async fn echo_call_returns_the_sum() {
    let channel = connect(calculator()).await;
    channel.wait_ready().await.unwrap();

    let result = channel
        .call(path(["sum"]), vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(result, json!(5));
    // No state change was observed along the way.
    assert_eq!(channel.state(), json!("a"));
}

#[tokio::test]
async fn calls_may_be_issued_before_ready() {
    // The initialize message is first on the wire, so calls queued behind it
    // resolve normally.
    let channel = connect(calculator()).await;
    let result = channel
        .call(path(["sum"]), vec![json!(20), json!(22)])
        .await
        .unwrap();
    assert_eq!(result, json!(42));
    assert!(channel.ready());
}

#[tokio::test]
async fn handler_errors_become_response_errors_and_keep_the_channel_open() {
    let channel = connect(calculator()).await;
    channel.wait_ready().await.unwrap();

    let error = channel
        .call(path(["no_such_method"]), vec![])
        .await
        .unwrap_err();
    assert!(error.message.contains("wrong path"), "{error}");

    // The channel survived and still serves calls.
    assert!(!channel.closed());
    let result = channel
        .call(path(["sum"]), vec![json!(1), json!(1)])
        .await
        .unwrap();
    assert_eq!(result, json!(2));
}

#[tokio::test]
async fn notify_runs_the_handler_and_discards_failures() {
    let channel = connect(calculator()).await;
    channel.wait_ready().await.unwrap();

    channel
        .notify(path(["set_state"]), vec![json!("notified")])
        .unwrap();
    let state = channel.clone();
    eventually("state replicated after notify", move || {
        state.state() == json!("notified")
    })
    .await;

    // A failing notify produces no response and no close.
    channel.notify(path(["__proto__"]), vec![]).unwrap();
    let result = channel
        .call(path(["sum"]), vec![json!(3), json!(4)])
        .await
        .unwrap();
    assert_eq!(result, json!(7));
    assert!(!channel.closed());
}

/// A raw handler that returns a source for plain calls, which the endpoint
/// must reject as "wrong data type".
struct SourceReturningHandler;

impl Handler for SourceReturningHandler {
    fn call(
        &self,
        _channel: SourceChannel,
        _path: statewire::Path,
        _args: Vec<Value>,
        _new_channel: bool,
    ) -> BoxFuture<'static, Result<Outcome, Error>> {
        Box::pin(async { Ok(Outcome::source(calculator())) })
    }
}

#[tokio::test]
async fn source_outcomes_on_plain_calls_are_wrong_data_type() {
    let channel = connect(Source::new(SourceReturningHandler, json!(null))).await;
    channel.wait_ready().await.unwrap();

    let error = channel.call(path(["anything"]), vec![]).await.unwrap_err();
    assert!(error.message.contains("wrong data type"), "{error}");
    assert!(!channel.closed());
}

#[tokio::test]
async fn concurrent_calls_settle_independently() {
    let channel = connect(calculator()).await;
    channel.wait_ready().await.unwrap();

    let first = channel.call(path(["sum"]), vec![json!(1), json!(2)]);
    let second = channel.call(path(["sum"]), vec![json!(10), json!(20)]);
    let third = channel.call(path(["missing"]), vec![]);
    let (first, second, third) = futures::join!(first, second, third);
    assert_eq!(first.unwrap(), json!(3));
    assert_eq!(second.unwrap(), json!(30));
    assert!(third.unwrap_err().message.contains("wrong path"));
}
