//! Tokio transports for statewire.
//!
//! Provides the pieces that need a runtime: JSON-Lines links over arbitrary
//! byte streams, a stdio link for processes serving their parent, child
//! process peers, and `Duration`-based connection timeouts.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use statewire::{Error, Link, LinkChannels};

mod lines;
mod process;

pub use lines::Lines;
pub use process::ChildPeer;

/// A link over this process's own stdin/stdout, for peers spawned as child
/// processes of their counterpart.
pub struct Stdio;

impl Link for Stdio {
    fn run(self: Box<Self>, channels: LinkChannels) -> BoxFuture<'static, Result<(), Error>> {
        Box::new(Lines::over(tokio::io::stdout(), tokio::io::stdin())).run(channels)
    }
}

/// A connection-timeout future for [`ChannelBuilder::connection_timeout`]:
/// resolves with the reason `"timeout"` after `duration`.
///
/// [`ChannelBuilder::connection_timeout`]: statewire::ChannelBuilder::connection_timeout
pub fn timeout_after(duration: Duration) -> impl Future<Output = Value> + Send + 'static {
    async move {
        tokio::time::sleep(duration).await;
        json!("timeout")
    }
}
