//! The server-side procedure holder.
//!
//! A [`Source`] owns a state value, a disposed flag, and an inner notice hub
//! that Source endpoints subscribe to once per link. One `Source` may back
//! any number of channels across any number of links; cloning the handle
//! clones a reference to the same source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::error::Error;
use crate::source_channel::SourceChannel;
use crate::wire::{Path, Value};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// What a [`Handler`] produced.
#[derive(Debug)]
pub enum Outcome {
    /// A plain result value (calls and notifies).
    Value(Value),
    /// A source for the new channel to bind to (channel creation).
    Source {
        source: Source,
        /// Dispose the source when the channel closes, for any reason.
        auto_dispose: bool,
    },
    /// An already-built, not-yet-initialized source channel to use as-is.
    Channel(SourceChannel),
}

impl Outcome {
    /// A plain value outcome.
    pub fn value(value: impl Into<Value>) -> Outcome {
        Outcome::Value(value.into())
    }

    /// A source outcome without auto-dispose.
    pub fn source(source: Source) -> Outcome {
        Outcome::Source {
            source,
            auto_dispose: false,
        }
    }
}

/// The one indirection a source holds: resolves `(channel, path, args,
/// new_channel)` to an [`Outcome`].
///
/// `channel` is the channel the request arrived on (for channel creation,
/// the parent). Handlers run concurrently with the endpoint's dispatch loop;
/// the endpoint re-checks the channel after the future resolves and drops
/// responses for channels that closed in the meantime.
pub trait Handler: Send + Sync {
    fn call(
        &self,
        channel: SourceChannel,
        path: Path,
        args: Vec<Value>,
        new_channel: bool,
    ) -> BoxFuture<'static, Result<Outcome, Error>>;
}

/// Notices published by a source to its per-link subscribers.
#[derive(Debug, Clone)]
pub(crate) enum SourceNotice {
    /// The state value changed.
    State(Value),
    /// A user event was broadcast.
    Event(Path, Vec<Value>),
    /// The source was disposed.
    Dispose(Value),
}

type NoticeListener = Arc<dyn Fn(&SourceNotice) + Send + Sync>;

struct SourceInner {
    state: Value,
    disposed: Option<Value>,
    next_listener: u64,
    listeners: Vec<(u64, NoticeListener)>,
}

struct SourceShared {
    id: u64,
    handler: Arc<dyn Handler>,
    // One mutex per source: mutation and notification happen under it, so
    // every link observes state changes, events, and dispose in emission
    // order.
    inner: Mutex<SourceInner>,
}

/// A server-side source: methods, a replicated state value, and event
/// broadcasts to every live subscriber across all links.
#[derive(Clone)]
pub struct Source {
    shared: Arc<SourceShared>,
}

impl Source {
    /// Create a source with the given handler and initial state.
    pub fn new(handler: impl Handler + 'static, initial_state: Value) -> Source {
        Source::with_handler(Arc::new(handler), initial_state)
    }

    /// Create a source from an already-shared handler.
    pub fn with_handler(handler: Arc<dyn Handler>, initial_state: Value) -> Source {
        Source {
            shared: Arc::new(SourceShared {
                id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
                handler,
                inner: Mutex::new(SourceInner {
                    state: initial_state,
                    disposed: None,
                    next_listener: 0,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Identity of this source; stable across clones of the handle.
    pub(crate) fn source_id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.shared.handler)
    }

    /// The current state value.
    pub fn state(&self) -> Value {
        self.shared.inner.lock().expect("source lock").state.clone()
    }

    /// Whether [`dispose`](Source::dispose) has been called.
    pub fn disposed(&self) -> bool {
        self.shared
            .inner
            .lock()
            .expect("source lock")
            .disposed
            .is_some()
    }

    /// The stored dispose reason, if disposed.
    pub fn dispose_reason(&self) -> Option<Value> {
        self.shared
            .inner
            .lock()
            .expect("source lock")
            .disposed
            .clone()
    }

    /// Assign a new state value and notify subscribers.
    ///
    /// If the new value equals the current one no notification is sent.
    /// Fails once the source is disposed.
    pub fn set_state(&self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        let mut inner = self.shared.inner.lock().expect("source lock");
        if let Some(reason) = &inner.disposed {
            return Err(Error::channel_closed().with_data(reason.clone()));
        }
        if inner.state == value {
            return Ok(());
        }
        inner.state = value.clone();
        Self::notify(&inner, &SourceNotice::State(value));
        Ok(())
    }

    /// Apply a function to the current state and assign the result.
    pub fn update_state(&self, update: impl FnOnce(&Value) -> Value) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().expect("source lock");
        if let Some(reason) = &inner.disposed {
            return Err(Error::channel_closed().with_data(reason.clone()));
        }
        let value = update(&inner.state);
        if inner.state == value {
            return Ok(());
        }
        inner.state = value.clone();
        Self::notify(&inner, &SourceNotice::State(value));
        Ok(())
    }

    /// Broadcast a user event to every live subscriber.
    ///
    /// The path must be non-empty. Fails once the source is disposed.
    pub fn emit(&self, path: Path, args: Vec<Value>) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::wrong_path("empty event path"));
        }
        let inner = self.shared.inner.lock().expect("source lock");
        if let Some(reason) = &inner.disposed {
            return Err(Error::channel_closed().with_data(reason.clone()));
        }
        Self::notify(&inner, &SourceNotice::Event(path, args));
        Ok(())
    }

    /// Dispose this source. Idempotent and terminal: subscribers receive a
    /// close with `reason`, and any channel opened against this source
    /// afterwards is rejected with the stored reason.
    pub fn dispose(&self, reason: impl Into<Value>) {
        let reason = reason.into();
        let mut inner = self.shared.inner.lock().expect("source lock");
        if inner.disposed.is_some() {
            return;
        }
        inner.disposed = Some(reason.clone());
        tracing::debug!(source = self.shared.id, ?reason, "source disposed");
        Self::notify(&inner, &SourceNotice::Dispose(reason));
    }

    fn notify(inner: &SourceInner, notice: &SourceNotice) {
        for (_, listener) in &inner.listeners {
            listener(notice);
        }
    }

    /// Attach a per-link notice listener. Returns `None` if the source is
    /// already disposed (subscribing would never observe anything).
    pub(crate) fn subscribe_notices(&self, listener: NoticeListener) -> Option<u64> {
        let mut inner = self.shared.inner.lock().expect("source lock");
        if inner.disposed.is_some() {
            return None;
        }
        inner.next_listener += 1;
        let id = inner.next_listener;
        inner.listeners.push((id, listener));
        Some(id)
    }

    pub(crate) fn unsubscribe_notices(&self, id: u64) {
        let mut inner = self.shared.inner.lock().expect("source lock");
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock().expect("source lock");
        f.debug_struct("Source")
            .field("id", &self.shared.id)
            .field("disposed", &inner.disposed.is_some())
            .field("subscribers", &inner.listeners.len())
            .finish()
    }
}
