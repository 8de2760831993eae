//! JSON-Lines link: one JSON array per newline-terminated line.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use statewire::wire::source_action;
use statewire::{Error, Link, LinkChannels, LinkEvent, WireMessage};

/// A [`Link`] speaking newline-delimited JSON arrays over a line sink and a
/// line stream.
pub struct Lines {
    outgoing: Pin<Box<dyn Sink<String, Error = std::io::Error> + Send>>,
    incoming: Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>,
}

impl Lines {
    /// Build from an arbitrary line sink and line stream.
    pub fn new(
        outgoing: impl Sink<String, Error = std::io::Error> + Send + 'static,
        incoming: impl Stream<Item = std::io::Result<String>> + Send + 'static,
    ) -> Lines {
        Lines {
            outgoing: Box::pin(outgoing),
            incoming: Box::pin(incoming),
        }
    }

    /// Build over tokio byte streams (sockets, pipes, child stdio).
    pub fn over(
        writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
    ) -> Lines {
        use futures::io::BufReader;
        use futures::AsyncBufReadExt as _;
        use futures::AsyncWriteExt as _;
        use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

        let incoming = BufReader::new(reader.compat()).lines();
        let outgoing = futures::sink::unfold(writer.compat_write(), |mut writer, line: String| {
            async move {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                writer.write_all(&bytes).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(writer)
            }
        });
        Lines::new(outgoing, incoming)
    }
}

/// Substitute message for one the codec refused: keep the addressing, drop
/// the payload for an error sentinel so the peer is still notified.
fn sentinel(message: &[Value]) -> Option<WireMessage> {
    let action = message.get(1)?.as_u64()?;
    // Source→client messages lead with the destination id array.
    if !message.first()?.is_array() {
        return None;
    }
    match action {
        source_action::RESPONSE_OK | source_action::RESPONSE_ERROR => Some(vec![
            message[0].clone(),
            Value::from(source_action::RESPONSE_ERROR),
            message.get(2)?.clone(),
            Value::String("parse error".into()),
        ]),
        source_action::STATE => Some(vec![
            message[0].clone(),
            Value::from(source_action::STATE),
            Value::String("state parse error".into()),
        ]),
        source_action::CLOSE => Some(vec![
            message[0].clone(),
            Value::from(source_action::CLOSE),
            Value::String("parse error".into()),
        ]),
        _ => None,
    }
}

fn encode_line(message: &[Value]) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

impl Link for Lines {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>> {
        let Lines {
            mut outgoing,
            mut incoming,
        } = *self;
        let LinkChannels {
            mut outgoing_rx,
            incoming_tx,
        } = channels;

        // The terminal close must be signaled at most once, whichever
        // direction fails first.
        let closed = Arc::new(AtomicBool::new(false));
        let signal_closed = {
            let incoming_tx = incoming_tx.clone();
            let closed = Arc::clone(&closed);
            move |reason: Value| {
                if !closed.swap(true, Ordering::SeqCst) {
                    let _ = incoming_tx.unbounded_send(LinkEvent::Closed(reason));
                }
            }
        };

        Box::pin(async move {
            let writer_closed = signal_closed.clone();
            let write_loop = async move {
                while let Some(message) = outgoing_rx.next().await {
                    let line = match encode_line(&message) {
                        Ok(line) => line,
                        Err(error) => {
                            tracing::error!(%error, "failed to encode message; retrying with sentinel");
                            match sentinel(&message).and_then(|m| encode_line(&m).ok()) {
                                Some(line) => line,
                                None => continue,
                            }
                        }
                    };
                    tracing::trace!(%line, "line out");
                    if let Err(error) = outgoing.send(line).await {
                        tracing::debug!(%error, "write failed; link closed");
                        writer_closed(Value::String(error.to_string()));
                        break;
                    }
                }
            };

            let read_loop = async move {
                loop {
                    match incoming.next().await {
                        Some(Ok(line)) => {
                            tracing::trace!(%line, "line in");
                            match serde_json::from_str::<Value>(&line) {
                                Ok(Value::Array(message)) => {
                                    if incoming_tx
                                        .unbounded_send(LinkEvent::Message(message))
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Ok(other) => {
                                    tracing::warn!(?other, "ignoring non-array line");
                                }
                                Err(error) => {
                                    tracing::warn!(%error, "ignoring unparsable line");
                                }
                            }
                        }
                        Some(Err(error)) => {
                            signal_closed(Value::String(error.to_string()));
                            break;
                        }
                        None => {
                            signal_closed(Value::String("connection closed".into()));
                            break;
                        }
                    }
                }
            };

            futures::join!(write_loop, read_loop);
            Ok(())
        })
    }
}
