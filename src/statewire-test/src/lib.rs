//! Test scaffolding for statewire.
//!
//! Provides a recording link wrapper that taps the raw wire traffic an
//! endpoint sends (for idempotence and grouping assertions) and a few
//! fixture sources shared by the integration suites.

use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{json, Value};
use statewire::{Error, HandlerTree, Link, LinkChannels, Source, WireMessage};

/// Ordered log of the raw messages an endpoint sent over its link.
#[derive(Clone)]
pub struct MessageLog {
    inner: Arc<Mutex<Vec<WireMessage>>>,
}

impl MessageLog {
    /// All recorded messages, in send order.
    pub fn messages(&self) -> Vec<WireMessage> {
        self.inner.lock().expect("log lock").clone()
    }

    /// Recorded messages whose action code (second element) matches.
    pub fn with_action(&self, action: u64) -> Vec<WireMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.get(1).and_then(Value::as_u64) == Some(action))
            .collect()
    }
}

/// A [`Link`] wrapper recording every outbound message of the endpoint it
/// is attached to before forwarding it to the inner link.
pub struct RecordingLink<L> {
    inner: L,
    log: Arc<Mutex<Vec<WireMessage>>>,
}

/// Wrap `inner`, returning the wrapper and the log it fills.
pub fn recording<L: Link>(inner: L) -> (RecordingLink<L>, MessageLog) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (
        RecordingLink {
            inner,
            log: Arc::clone(&log),
        },
        MessageLog { inner: log },
    )
}

impl<L: Link + 'static> Link for RecordingLink<L> {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>> {
        let RecordingLink { inner, log } = *self;
        let LinkChannels {
            mut outgoing_rx,
            incoming_tx,
        } = channels;
        let (tap_tx, tap_rx) = mpsc::unbounded();
        let inner_run = Box::new(inner).run(LinkChannels {
            outgoing_rx: tap_rx,
            incoming_tx,
        });
        Box::pin(async move {
            let pump = async move {
                while let Some(message) = outgoing_rx.next().await {
                    log.lock().expect("log lock").push(message.clone());
                    if tap_tx.unbounded_send(message).is_err() {
                        break;
                    }
                }
                Ok::<(), Error>(())
            };
            futures::try_join!(pump, inner_run)?;
            Ok(())
        })
    }
}

/// Poll `condition` until it holds, panicking after ~2 seconds. For
/// assertions about effects that cross the driver loops asynchronously.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {what}");
}

/// A calculator source with initial state `"a"`.
///
/// Methods: `sum(x, y)`, `set_state(v)` (writes the source state, so every
/// subscribed channel observes it), and `emit_tick(..args)` (broadcasts the
/// `tick` event).
pub fn calculator() -> Source {
    HandlerTree::new()
        .method("sum", |_cx, args| async move {
            let x = args.first().and_then(Value::as_i64).unwrap_or(0);
            let y = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(x + y)
        })
        .method("set_state", |cx, args| async move {
            let value = args.into_iter().next().unwrap_or(Value::Null);
            cx.channel.source().set_state(value)?;
            Ok(Value::Null)
        })
        .method("emit_tick", |cx, args| async move {
            cx.channel.source().emit(statewire::path(["tick"]), args)?;
            Ok(Value::Null)
        })
        .into_source(json!("a"))
        .expect("valid handler tree")
}

/// A counter source whose state is a number, with an `add(n)` method.
pub fn counter(initial: i64) -> Source {
    HandlerTree::new()
        .method("add", |cx, args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or(1);
            let source = cx.channel.source();
            source.update_state(|state| json!(state.as_i64().unwrap_or(0) + n))?;
            Ok(source.state())
        })
        .into_source(json!(initial))
        .expect("valid handler tree")
}

/// A parent source exposing nested channels:
///
/// - `inner`: a shared calculator source (zero-argument channel creation),
/// - `Counter(initial)`: a constructor minting a fresh counter per channel
///   (auto-disposed on close).
pub fn with_nested() -> Source {
    let inner = calculator();
    HandlerTree::new()
        .method("ping", |_cx, _args| async { Ok("pong") })
        .source("inner", inner)
        .constructor("Counter", |_cx, args| async move {
            let initial = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(counter(initial))
        })
        .into_source(json!("parent"))
        .expect("valid handler tree")
}
