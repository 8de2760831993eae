//! Named multi-listener event dispatch.
//!
//! Both endpoints hang lifecycle and user events off an [`Emitter`]:
//! `ready`/`error`/`close` on channel handles, and canonical path keys for
//! user events on the client side. Listeners run in subscription order; a
//! failing listener is logged and does not stop the rest.

use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::error::Error;
use crate::wire::Value;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&[Value]) -> Result<(), Error> + Send + Sync>;

struct Entry {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: FxHashMap<String, Vec<Entry>>,
}

/// A keyed listener registry with `on`/`once`/`off` semantics.
#[derive(Default)]
pub struct Emitter {
    inner: Mutex<Inner>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter::default()
    }

    /// Register a listener under `key`.
    pub fn on<F>(&self, key: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.register(key.into(), Arc::new(listener), false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<F>(&self, key: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.register(key.into(), Arc::new(listener), true)
    }

    fn register(&self, key: String, listener: Listener, once: bool) -> ListenerId {
        let mut inner = self.inner.lock().expect("emitter lock");
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(key)
            .or_default()
            .push(Entry { id, once, listener });
        id
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn off(&self, key: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().expect("emitter lock");
        let Some(entries) = inner.listeners.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            inner.listeners.remove(key);
        }
        removed
    }

    /// Invoke every listener registered under `key`, in subscription order.
    ///
    /// `once` listeners are deregistered before invocation, so a reentrant
    /// emit cannot fire them twice. Listener errors are logged and the
    /// remaining listeners still run.
    pub fn emit(&self, key: &str, args: &[Value]) {
        let snapshot: Vec<Listener> = {
            let mut inner = self.inner.lock().expect("emitter lock");
            let Some(entries) = inner.listeners.get_mut(key) else {
                return;
            };
            let snapshot = entries
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                inner.listeners.remove(key);
            }
            snapshot
        };
        for listener in snapshot {
            if let Err(error) = listener(args) {
                tracing::warn!(key, %error, "event listener failed");
            }
        }
    }

    /// Number of listeners currently registered under `key`.
    pub fn listener_count(&self, key: &str) -> usize {
        let inner = self.inner.lock().expect("emitter lock");
        inner.listeners.get(key).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("emitter lock");
        let keys: Vec<&String> = inner.listeners.keys().collect();
        f.debug_struct("Emitter").field("keys", &keys).finish()
    }
}
