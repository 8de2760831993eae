//! # statewire: stateful multiplexed RPC
//!
//! `statewire` multiplexes many logical channels over one ordered,
//! message-oriented link. Every channel exposes a tree of remotely callable
//! procedures, a replicated **state** value, and a hierarchical **event**
//! bus. Channels are recursive: a remote call can open a child channel bound
//! to a different [`Source`], and any number of client channels may
//! subscribe to the same source, observing identical state changes and
//! events.
//!
//! The two endpoint roles:
//!
//! - the **Source endpoint** ([`serve`]) hosts a root [`Source`] on a link,
//!   dispatching calls and fanning out state/event/close broadcasts;
//! - the **Channel endpoint** ([`ChannelBuilder`]) drives the client side,
//!   matching call responses, replicating state, and routing events to
//!   [`Channel`] handles.
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use statewire::{memory_link_pair, ChannelBuilder, HandlerTree, SourceOptions};
//!
//! # async fn example() -> Result<(), statewire::Error> {
//! let source = HandlerTree::new()
//!     .method("sum", |_cx, args| async move {
//!         Ok(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0))
//!     })
//!     .into_source(json!("idle"))?;
//!
//! let (server_link, client_link) = memory_link_pair();
//! let server = statewire::serve(source, server_link, SourceOptions::new());
//! let (channel, driver) = ChannelBuilder::new().connect(client_link);
//!
//! // Spawn `server` and `driver`, then:
//! let five = channel.call(statewire::path(["sum"]), vec![json!(2), json!(3)]);
//! # let _ = (server, driver, five);
//! # Ok(())
//! # }
//! ```
//!
//! Transports implement [`Link`]; in-process pairs come from
//! [`memory_link_pair`], byte-stream and child-process transports from the
//! `statewire-tokio` crate.

mod channel;
mod emitter;
mod error;
mod handler;
mod source;
mod source_channel;
mod source_endpoint;
mod transport;
pub mod wire;

pub use channel::{Channel, ChannelBuilder, IntoEventKey};
pub use emitter::{Emitter, Listener, ListenerId};
pub use error::{codes, Error};
pub use handler::{Construct, DefaultHandler, HandlerTree, Method, MethodCx};
pub use source::{Handler, Outcome, Source};
pub use source_channel::SourceChannel;
pub use source_endpoint::{serve, ChannelHook, SourceOptions};
pub use transport::{memory_link_pair, Link, LinkChannels, LinkEvent, MemoryLink};
pub use wire::{path, ChannelId, Path, Segment, SourceMessage, Value, WireMessage};

// Re-export BoxFuture: implementing [`Link`] or [`Handler`] requires it.
pub use futures::future::BoxFuture;
