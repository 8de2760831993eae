//! The server-side handle for one accepted channel.
//!
//! A `SourceChannel` is created pending and bound to a [`Source`]. The
//! endpoint binds it to a link and channel id during initialization; from
//! then on it can emit events to its single peer channel and be closed from
//! either side. Lifecycle is monotonic: pending → ready → closed, or
//! pending → closed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::{mpsc, oneshot};

use crate::emitter::{Emitter, ListenerId};
use crate::error::Error;
use crate::source::Source;
use crate::source_endpoint::DriverEvent;
use crate::wire::{ChannelId, Path, Value};

struct Binding {
    channel_id: ChannelId,
    context: Value,
    driver_tx: mpsc::UnboundedSender<DriverEvent>,
}

struct Lifecycle {
    ready: bool,
    closed: Option<Value>,
    waiters: Vec<oneshot::Sender<Result<(), Error>>>,
}

struct Shared {
    source: Source,
    binding: Mutex<Option<Binding>>,
    lifecycle: Mutex<Lifecycle>,
    hub: Emitter,
    auto_dispose: AtomicBool,
}

/// One accepted channel, seen from the Source endpoint.
#[derive(Clone)]
pub struct SourceChannel {
    shared: Arc<Shared>,
}

impl SourceChannel {
    /// Create a pending channel bound to `source`, not yet attached to any
    /// link. Handlers may return one of these from a channel-creation call
    /// to have the endpoint initialize it as-is.
    pub fn new(source: Source) -> SourceChannel {
        SourceChannel {
            shared: Arc::new(Shared {
                source,
                binding: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    ready: false,
                    closed: None,
                    waiters: Vec::new(),
                }),
                hub: Emitter::new(),
                auto_dispose: AtomicBool::new(false),
            }),
        }
    }

    /// The source this channel is bound to.
    pub fn source(&self) -> Source {
        self.shared.source.clone()
    }

    /// The channel id, once initialized.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.shared
            .binding
            .lock()
            .expect("channel lock")
            .as_ref()
            .map(|b| b.channel_id.clone())
    }

    /// The application context attached at initialization (endpoint-level,
    /// typically the transport identity). `Null` before initialization.
    pub fn context(&self) -> Value {
        self.shared
            .binding
            .lock()
            .expect("channel lock")
            .as_ref()
            .map(|b| b.context.clone())
            .unwrap_or(Value::Null)
    }

    /// Whether the initial state has been sent and the channel is live.
    pub fn ready(&self) -> bool {
        self.shared.lifecycle.lock().expect("channel lock").ready
    }

    /// Whether the channel is closed.
    pub fn closed(&self) -> bool {
        self.shared
            .lifecycle
            .lock()
            .expect("channel lock")
            .closed
            .is_some()
    }

    /// The close reason, once closed.
    pub fn close_reason(&self) -> Option<Value> {
        self.shared
            .lifecycle
            .lock()
            .expect("channel lock")
            .closed
            .clone()
    }

    /// Dispose the bound source when this channel closes, for any reason.
    pub fn set_auto_dispose(&self, auto_dispose: bool) {
        self.shared
            .auto_dispose
            .store(auto_dispose, Ordering::Relaxed);
    }

    /// Whether closing this channel disposes the bound source.
    pub fn auto_dispose(&self) -> bool {
        self.shared.auto_dispose.load(Ordering::Relaxed)
    }

    /// Resolves when the channel becomes ready; fails if it closes first
    /// (with the close reason).
    pub fn wait_ready(&self) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let pending = {
            let mut lifecycle = self.shared.lifecycle.lock().expect("channel lock");
            if lifecycle.ready {
                None
            } else if let Some(reason) = &lifecycle.closed {
                return futures::future::Either::Left(futures::future::ready(Err(
                    Error::from_value(reason),
                )));
            } else {
                let (tx, rx) = oneshot::channel();
                lifecycle.waiters.push(tx);
                Some(rx)
            }
        };
        futures::future::Either::Right(async move {
            match pending {
                None => Ok(()),
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(Error::channel_closed())),
            }
        })
    }

    /// Send a user event to this channel only.
    pub fn emit(&self, path: Path, args: Vec<Value>) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::wrong_path("empty event path"));
        }
        if let Some(reason) = self.close_reason() {
            return Err(Error::channel_closed().with_data(reason));
        }
        let binding = self.shared.binding.lock().expect("channel lock");
        let Some(binding) = binding.as_ref() else {
            return Err(Error::internal_error().with_data("channel not initialized"));
        };
        binding
            .driver_tx
            .unbounded_send(DriverEvent::ChannelEmit {
                channel_id: binding.channel_id.clone(),
                path,
                args,
            })
            .map_err(Error::into_internal_error)
    }

    /// Close this channel. Idempotent. Notifies the peer if the channel was
    /// registered, and disposes the bound source if auto-dispose is set.
    pub fn close(&self, reason: impl Into<Value>) {
        let reason = reason.into();
        if !self.close_local(reason.clone()) {
            return;
        }
        let binding = self.shared.binding.lock().expect("channel lock");
        if let Some(binding) = binding.as_ref() {
            let _ = binding.driver_tx.unbounded_send(DriverEvent::ChannelClosed {
                channel_id: binding.channel_id.clone(),
                source_id: self.shared.source.source_id(),
                reason,
                notify_peer: true,
            });
        }
    }

    /// Register a lifecycle listener (`"ready"`, `"error"`, `"close"`).
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.hub.on(event, listener)
    }

    /// Register a one-shot lifecycle listener.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.hub.once(event, listener)
    }

    /// Remove a lifecycle listener.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.shared.hub.off(event, id)
    }

    /// Attach this channel to a link. Fails if it was already initialized.
    pub(crate) fn bind(
        &self,
        channel_id: ChannelId,
        context: Value,
        driver_tx: mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<(), Error> {
        let mut binding = self.shared.binding.lock().expect("channel lock");
        if binding.is_some() {
            return Err(Error::internal_error().with_data("channel already initialized"));
        }
        *binding = Some(Binding {
            channel_id,
            context,
            driver_tx,
        });
        Ok(())
    }

    /// Transition pending → ready. No-op if closed or already ready.
    pub(crate) fn mark_ready(&self) {
        let waiters = {
            let mut lifecycle = self.shared.lifecycle.lock().expect("channel lock");
            if lifecycle.ready || lifecycle.closed.is_some() {
                return;
            }
            lifecycle.ready = true;
            std::mem::take(&mut lifecycle.waiters)
        };
        self.shared.hub.emit("ready", &[]);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Transition to closed without touching the link: fire `error` (when
    /// never ready) and `close`, settle waiters, honor auto-dispose.
    /// Returns whether this call performed the transition.
    pub(crate) fn close_local(&self, reason: Value) -> bool {
        let (was_ready, waiters) = {
            let mut lifecycle = self.shared.lifecycle.lock().expect("channel lock");
            if lifecycle.closed.is_some() {
                return false;
            }
            lifecycle.closed = Some(reason.clone());
            (lifecycle.ready, std::mem::take(&mut lifecycle.waiters))
        };
        if !was_ready {
            self.shared.hub.emit("error", std::slice::from_ref(&reason));
        }
        self.shared.hub.emit("close", std::slice::from_ref(&reason));
        let error = Error::from_value(&reason);
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        if self.auto_dispose() {
            self.shared.source.dispose(reason);
        }
        true
    }
}

impl std::fmt::Debug for SourceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.shared.lifecycle.lock().expect("channel lock");
        f.debug_struct("SourceChannel")
            .field("channel_id", &self.channel_id())
            .field("ready", &lifecycle.ready)
            .field("closed", &lifecycle.closed.is_some())
            .finish()
    }
}
