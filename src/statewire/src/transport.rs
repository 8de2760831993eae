//! Link abstraction between an endpoint and its transport.
//!
//! The core never touches bytes: a transport receives a pair of unbounded
//! channels, forwards outbound raw messages to the peer, and delivers peer
//! messages (and the single terminal close) back in. Messages queued before
//! the transport future starts polling are buffered by the channel and
//! flushed in order, which is what gives endpoints their send-before-ready
//! guarantee.

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::json;

use crate::error::Error;
use crate::wire::{Value, WireMessage};

/// Inbound traffic from the peer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An ordered, already-decoded message.
    Message(WireMessage),
    /// Terminal close with a reason. Must be signaled at most once; nothing
    /// may be delivered afterwards.
    Closed(Value),
}

/// The channel pair handed to a transport by an endpoint.
pub struct LinkChannels {
    /// Messages the endpoint wants delivered to the peer, in order.
    pub outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
    /// Deliver peer messages and the terminal close here.
    pub incoming_tx: mpsc::UnboundedSender<LinkEvent>,
}

/// A transport carrying one link.
///
/// `run` resolves when the transport is finished in either direction; the
/// endpoint composes it with its own driver loop and shuts down when either
/// side completes.
pub trait Link: Send {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>>;
}

/// An in-process link half, connected to its twin from [`memory_link_pair`].
///
/// Useful for tests and for wiring two endpoints living in the same process.
pub struct MemoryLink {
    peer_tx: mpsc::UnboundedSender<WireMessage>,
    peer_rx: mpsc::UnboundedReceiver<WireMessage>,
}

/// Create a connected pair of in-process links.
pub fn memory_link_pair() -> (MemoryLink, MemoryLink) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (
        MemoryLink {
            peer_tx: a_tx,
            peer_rx: a_rx,
        },
        MemoryLink {
            peer_tx: b_tx,
            peer_rx: b_rx,
        },
    )
}

impl Link for MemoryLink {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>> {
        let MemoryLink {
            peer_tx,
            mut peer_rx,
        } = *self;
        let LinkChannels {
            mut outgoing_rx,
            incoming_tx,
        } = channels;
        Box::pin(async move {
            loop {
                futures::select! {
                    outbound = outgoing_rx.next() => match outbound {
                        Some(message) => {
                            // Peer gone: swallow, the inbound side will see
                            // the close shortly.
                            let _ = peer_tx.unbounded_send(message);
                        }
                        None => break,
                    },
                    inbound = peer_rx.next() => match inbound {
                        Some(message) => {
                            let _ = incoming_tx.unbounded_send(LinkEvent::Message(message));
                        }
                        None => {
                            let _ = incoming_tx
                                .unbounded_send(LinkEvent::Closed(json!("connection closed")));
                            break;
                        }
                    },
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_in_order_and_signals_close() {
        futures::executor::block_on(async {
            let (left, right) = memory_link_pair();

            let (out_tx, out_rx) = mpsc::unbounded();
            let (in_tx, _in_rx) = mpsc::unbounded();
            let left_run = Box::new(left).run(LinkChannels {
                outgoing_rx: out_rx,
                incoming_tx: in_tx,
            });

            let (peer_out_tx, peer_out_rx) = mpsc::unbounded();
            let (peer_in_tx, mut peer_in_rx) = mpsc::unbounded();
            let right_run = Box::new(right).run(LinkChannels {
                outgoing_rx: peer_out_rx,
                incoming_tx: peer_in_tx,
            });

            out_tx.unbounded_send(vec![json!(1)]).unwrap();
            out_tx.unbounded_send(vec![json!(2)]).unwrap();
            drop(out_tx);

            let reader = async move {
                let mut received = Vec::new();
                while let Some(event) = peer_in_rx.next().await {
                    let done = matches!(event, LinkEvent::Closed(_));
                    received.push(event);
                    if done {
                        break;
                    }
                }
                // Let the right half shut down once we have everything.
                drop(peer_out_tx);
                received
            };

            let (_, _, received) = futures::join!(left_run, right_run, reader);
            let messages: Vec<&WireMessage> = received
                .iter()
                .filter_map(|event| match event {
                    LinkEvent::Message(m) => Some(m),
                    LinkEvent::Closed(_) => None,
                })
                .collect();
            assert_eq!(messages, vec![&vec![json!(1)], &vec![json!(2)]]);
            assert!(matches!(received.last(), Some(LinkEvent::Closed(_))));
        });
    }
}
