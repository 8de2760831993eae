//! The Channel-side endpoint: client driver and per-channel handles.
//!
//! One driver loop per link owns the channel registry and the pending-call
//! table. Handles reach it through an unbounded command channel; inbound
//! source messages settle pending calls, replicate state, and fan user
//! events out over canonical keys.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use futures::StreamExt as _;
use futures_concurrency::stream::StreamExt as _;
use fxhash::FxHashMap;
use serde_json::json;

use crate::emitter::{Emitter, ListenerId};
use crate::error::Error;
use crate::transport::{Link, LinkChannels, LinkEvent};
use crate::wire::{
    event_path_key, ChannelId, ClientMessage, Path, Segment, SourceMessage, Value, WireMessage,
};

/// Built-in lifecycle event names on a [`Channel`].
const BUILTIN_EVENTS: [&str; 4] = ["ready", "error", "close", "state"];

/// Anything usable as an event subscription key.
///
/// A bare string names a built-in lifecycle event when it is one of
/// `ready`/`error`/`close`/`state`; any other bare string is canonicalized
/// as a single-segment path, which is also how a remote event that happens
/// to be named `state` is addressed without colliding with the built-in.
pub trait IntoEventKey {
    fn into_event_key(self) -> String;
}

impl IntoEventKey for &str {
    fn into_event_key(self) -> String {
        if BUILTIN_EVENTS.contains(&self) {
            self.to_string()
        } else {
            event_path_key(&[Segment::from(self)])
        }
    }
}

impl IntoEventKey for String {
    fn into_event_key(self) -> String {
        self.as_str().into_event_key()
    }
}

impl IntoEventKey for &[Segment] {
    fn into_event_key(self) -> String {
        event_path_key(self)
    }
}

impl IntoEventKey for Path {
    fn into_event_key(self) -> String {
        event_path_key(&self)
    }
}

impl<const N: usize> IntoEventKey for [&str; N] {
    fn into_event_key(self) -> String {
        event_path_key(&self.map(Segment::from))
    }
}

/// Default channel id: 16 hex chars of a fresh v4 UUID.
fn random_channel_id() -> ChannelId {
    let id = uuid::Uuid::new_v4().simple().to_string();
    ChannelId::Str(id[..16].to_string())
}

enum Command {
    Call {
        channel: ChannelId,
        response_key: u64,
        path: Path,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
    Notify {
        channel: ChannelId,
        path: Path,
        args: Vec<Value>,
    },
    Open {
        parent: ChannelId,
        shared: Arc<ChannelShared>,
        path: Path,
        args: Vec<Value>,
    },
    Close {
        channel: ChannelId,
        reason: Value,
    },
}

struct Lifecycle {
    ready: bool,
    closed: Option<Value>,
    state: Value,
    waiters: Vec<oneshot::Sender<Result<(), Error>>>,
}

pub(crate) struct ChannelShared {
    channel_id: ChannelId,
    hub: Emitter,
    lifecycle: Mutex<Lifecycle>,
    next_call: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    id_gen: Arc<dyn Fn() -> ChannelId + Send + Sync>,
}

impl ChannelShared {
    fn new(
        channel_id: ChannelId,
        cmd_tx: mpsc::UnboundedSender<Command>,
        id_gen: Arc<dyn Fn() -> ChannelId + Send + Sync>,
    ) -> Arc<ChannelShared> {
        Arc::new(ChannelShared {
            channel_id,
            hub: Emitter::new(),
            lifecycle: Mutex::new(Lifecycle {
                ready: false,
                closed: None,
                state: Value::Null,
                waiters: Vec::new(),
            }),
            next_call: AtomicU64::new(0),
            cmd_tx,
            id_gen,
        })
    }

    /// Store a replicated state value; first one marks the channel ready.
    fn apply_state(&self, value: Value) {
        enum Became {
            Ready(Vec<oneshot::Sender<Result<(), Error>>>),
            Update(Value),
        }
        let became = {
            let mut lifecycle = self.lifecycle.lock().expect("channel lock");
            if lifecycle.closed.is_some() {
                return;
            }
            let old = std::mem::replace(&mut lifecycle.state, value.clone());
            if lifecycle.ready {
                Became::Update(old)
            } else {
                lifecycle.ready = true;
                Became::Ready(std::mem::take(&mut lifecycle.waiters))
            }
        };
        match became {
            Became::Ready(waiters) => {
                self.hub.emit("ready", &[]);
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.hub.emit("state", std::slice::from_ref(&value));
            }
            Became::Update(old) => {
                self.hub.emit("state", &[value, old]);
            }
        }
    }

    /// Transition to closed: fire `error` (when never ready) and `close`,
    /// settle readiness waiters. Returns whether this call transitioned.
    fn close_local(&self, reason: &Value) -> bool {
        let (was_ready, waiters) = {
            let mut lifecycle = self.lifecycle.lock().expect("channel lock");
            if lifecycle.closed.is_some() {
                return false;
            }
            lifecycle.closed = Some(reason.clone());
            (lifecycle.ready, std::mem::take(&mut lifecycle.waiters))
        };
        if !was_ready {
            self.hub.emit("error", std::slice::from_ref(reason));
        }
        self.hub.emit("close", std::slice::from_ref(reason));
        let error = Error::from_value(reason);
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        true
    }

    fn is_ready(&self) -> bool {
        self.lifecycle.lock().expect("channel lock").ready
    }

    fn close_reason(&self) -> Option<Value> {
        self.lifecycle.lock().expect("channel lock").closed.clone()
    }
}

/// A client-side channel handle: remote dispatch, replicated state, events.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// This channel's id on the link.
    pub fn channel_id(&self) -> ChannelId {
        self.shared.channel_id.clone()
    }

    /// The most recently replicated state value (`Null` before ready).
    pub fn state(&self) -> Value {
        self.shared
            .lifecycle
            .lock()
            .expect("channel lock")
            .state
            .clone()
    }

    /// Whether the initial state has arrived.
    pub fn ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Whether the channel is closed.
    pub fn closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    /// The close reason, once closed.
    pub fn close_reason(&self) -> Option<Value> {
        self.shared.close_reason()
    }

    /// Resolves when the channel becomes ready; fails with the close reason
    /// if it closes first.
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
                Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::channel_closed())),
            }
        })
    }

    /// Call a remote method. The returned future settles with the remote
    /// response, or with the close reason if the channel closes first.
    pub fn call(
        &self,
        path: Path,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, Error>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let setup = if let Some(reason) = self.shared.close_reason() {
            Err(Error::from_value(&reason))
        } else {
            let response_key = self.shared.next_call.fetch_add(1, Ordering::Relaxed);
            self.shared
                .cmd_tx
                .unbounded_send(Command::Call {
                    channel: self.shared.channel_id.clone(),
                    response_key,
                    path,
                    args,
                    reply,
                })
                .map_err(|_| Error::channel_closed().with_data("connection closed"))
        };
        async move {
            setup?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::channel_closed().with_data("connection closed")),
            }
        }
    }

    /// Fire-and-forget method invocation; the remote discards result and
    /// errors. Fails only when the channel is already closed.
    pub fn notify(&self, path: Path, args: Vec<Value>) -> Result<(), Error> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(Error::from_value(&reason));
        }
        self.shared
            .cmd_tx
            .unbounded_send(Command::Notify {
                channel: self.shared.channel_id.clone(),
                path,
                args,
            })
            .map_err(|_| Error::channel_closed().with_data("connection closed"))
    }

    /// Open a nested channel through a channel-creation call. The handle is
    /// returned immediately; readiness is settled by the remote's first
    /// `STATE` (or a `CLOSE`).
    pub fn open(&self, path: Path, args: Vec<Value>) -> Channel {
        let id = (self.shared.id_gen)();
        let shared = ChannelShared::new(
            id,
            self.shared.cmd_tx.clone(),
            Arc::clone(&self.shared.id_gen),
        );
        let _ = self.shared.cmd_tx.unbounded_send(Command::Open {
            parent: self.shared.channel_id.clone(),
            shared: Arc::clone(&shared),
            path,
            args,
        });
        Channel { shared }
    }

    /// Close this channel. Idempotent; at most one `CLOSE` reaches the wire.
    pub fn close(&self, reason: impl Into<Value>) {
        let reason = reason.into();
        if !self.shared.close_local(&reason) {
            return;
        }
        let _ = self.shared.cmd_tx.unbounded_send(Command::Close {
            channel: self.shared.channel_id.clone(),
            reason,
        });
    }

    /// Register an event listener. See [`IntoEventKey`] for addressing.
    pub fn on<K, F>(&self, key: K, listener: F) -> ListenerId
    where
        K: IntoEventKey,
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.hub.on(key.into_event_key(), listener)
    }

    /// Register a one-shot event listener.
    pub fn once<K, F>(&self, key: K, listener: F) -> ListenerId
    where
        K: IntoEventKey,
        F: Fn(&[Value]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.hub.once(key.into_event_key(), listener)
    }

    /// Remove an event listener.
    pub fn off<K: IntoEventKey>(&self, key: K, id: ListenerId) -> bool {
        self.shared.hub.off(&key.into_event_key(), id)
    }

    /// Subscribe to an event as a stream of argument tuples.
    pub fn subscribe<K: IntoEventKey>(&self, key: K) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded();
        self.on(key, move |args| {
            // A dropped receiver just stops observing.
            let _ = tx.unbounded_send(args.to_vec());
            Ok(())
        });
        rx
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.shared.lifecycle.lock().expect("channel lock");
        f.debug_struct("Channel")
            .field("channel_id", &self.shared.channel_id)
            .field("ready", &lifecycle.ready)
            .field("closed", &lifecycle.closed.is_some())
            .finish()
    }
}

/// Builder for the client endpoint.
pub struct ChannelBuilder {
    id_gen: Arc<dyn Fn() -> ChannelId + Send + Sync>,
    timeout: Option<BoxFuture<'static, Value>>,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        ChannelBuilder {
            id_gen: Arc::new(random_channel_id),
            timeout: None,
        }
    }
}

impl ChannelBuilder {
    pub fn new() -> Self {
        ChannelBuilder::default()
    }

    /// Replace the channel id generator (default: 16-char random ids).
    pub fn channel_id_generator<F>(mut self, id_gen: F) -> Self
    where
        F: Fn() -> ChannelId + Send + Sync + 'static,
    {
        self.id_gen = Arc::new(id_gen);
        self
    }

    /// Arm a connection timeout: when the future resolves and the root
    /// channel is still pending, the root closes with the resolved reason.
    /// A ready channel is never affected.
    pub fn connection_timeout<Fut>(mut self, timeout: Fut) -> Self
    where
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.timeout = Some(Box::pin(timeout));
        self
    }

    /// Connect over a link. Returns the root channel handle and the driver
    /// future, which must be polled (spawned) for the endpoint to make
    /// progress; it resolves when the link closes.
    pub fn connect(
        self,
        link: impl Link + 'static,
    ) -> (Channel, impl Future<Output = Result<(), Error>> + Send) {
        let ChannelBuilder { id_gen, timeout } = self;
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
        let (incoming_tx, incoming_rx) = mpsc::unbounded();
        let (cmd_tx, cmd_rx) = mpsc::unbounded();

        let root_id = (id_gen)();
        let shared = ChannelShared::new(root_id.clone(), cmd_tx, id_gen);
        let root = Channel {
            shared: Arc::clone(&shared),
        };

        let transport = Box::new(link).run(LinkChannels {
            outgoing_rx,
            incoming_tx,
        });
        let mut registry = FxHashMap::default();
        registry.insert(root_id.clone(), shared);
        let driver = ChannelDriver {
            root_id,
            outgoing_tx,
            registry,
            pending: FxHashMap::default(),
        };
        let future = async move {
            futures::try_join!(transport, driver.run(incoming_rx, cmd_rx, timeout))?;
            Ok(())
        };
        (root, future)
    }
}

enum Ev {
    Link(LinkEvent),
    LinkEnded,
    Command(Command),
}

struct ChannelDriver {
    root_id: ChannelId,
    outgoing_tx: mpsc::UnboundedSender<WireMessage>,
    registry: FxHashMap<ChannelId, Arc<ChannelShared>>,
    pending: FxHashMap<ChannelId, FxHashMap<u64, oneshot::Sender<Result<Value, Error>>>>,
}

impl ChannelDriver {
    async fn run(
        mut self,
        incoming_rx: mpsc::UnboundedReceiver<LinkEvent>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        timeout: Option<BoxFuture<'static, Value>>,
    ) -> Result<(), Error> {
        // The initialize message engages the root channel on the remote.
        self.send(ClientMessage::Init {
            channel: self.root_id.clone(),
        });

        // UFCS for `chain`: both StreamExt traits in scope provide one.
        let incoming = futures::StreamExt::chain(
            incoming_rx.map(Ev::Link),
            futures::stream::once(futures::future::ready(Ev::LinkEnded)),
        );
        let merged = incoming.merge(cmd_rx.map(Ev::Command));
        let mut merged = merged.fuse();
        futures::pin_mut!(merged);
        let mut timeout = match timeout {
            Some(timeout) => timeout,
            None => Box::pin(futures::future::pending()) as BoxFuture<'static, Value>,
        }
        .fuse();

        loop {
            let event = futures::select! {
                event = merged.next() => match event {
                    Some(event) => event,
                    None => Ev::LinkEnded,
                },
                reason = timeout => {
                    self.handle_timeout(reason);
                    continue;
                }
            };
            match event {
                Ev::Link(LinkEvent::Message(raw)) => self.handle_message(raw),
                Ev::Link(LinkEvent::Closed(reason)) => {
                    tracing::debug!(?reason, "link closed");
                    self.shutdown(reason);
                    return Ok(());
                }
                Ev::LinkEnded => {
                    tracing::debug!("link ended without close");
                    self.shutdown(json!("connection closed"));
                    return Ok(());
                }
                Ev::Command(command) => self.handle_command(command),
            }
        }
    }

    fn handle_timeout(&mut self, reason: Value) {
        let still_pending = self
            .registry
            .get(&self.root_id)
            .map(|shared| !shared.is_ready())
            .unwrap_or(false);
        if still_pending {
            tracing::debug!(?reason, "connection timeout; closing pending root channel");
            let root_id = self.root_id.clone();
            self.close_channel(&root_id, reason, true);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                channel,
                response_key,
                path,
                args,
                reply,
            } => {
                let Some(shared) = self.registry.get(&channel) else {
                    let _ = reply.send(Err(Error::channel_closed()));
                    return;
                };
                if let Some(reason) = shared.close_reason() {
                    let _ = reply.send(Err(Error::from_value(&reason)));
                    return;
                }
                self.pending
                    .entry(channel.clone())
                    .or_default()
                    .insert(response_key, reply);
                self.send(ClientMessage::Call {
                    channel,
                    response_key,
                    path,
                    args,
                });
            }
            Command::Notify {
                channel,
                path,
                args,
            } => {
                if self.registry.contains_key(&channel) {
                    self.send(ClientMessage::Notify {
                        channel,
                        path,
                        args,
                    });
                }
            }
            Command::Open {
                parent,
                shared,
                path,
                args,
            } => {
                let id = shared.channel_id.clone();
                if let Some(prior) = self.registry.insert(id.clone(), shared) {
                    // Colliding local ids: the prior channel loses, exactly
                    // like the remote registry rule.
                    let error = Error::channel_conflict();
                    tracing::warn!(%id, "local channel id conflict");
                    prior.close_local(&error.to_value());
                    self.reject_pending(&id, &error.to_value());
                }
                self.send(ClientMessage::Create {
                    channel: parent,
                    new_channel: id,
                    path,
                    args,
                });
            }
            Command::Close { channel, reason } => {
                self.close_channel(&channel, reason, true);
            }
        }
    }

    fn handle_message(&mut self, raw: WireMessage) {
        let Some(message) = SourceMessage::decode(&raw) else {
            tracing::warn!(?raw, "ignoring malformed source message");
            return;
        };
        tracing::trace!(?message, "dispatching source message");
        match message {
            SourceMessage::ResponseOk {
                channels,
                response_key,
                value,
            } => {
                for id in channels {
                    self.settle(&id, response_key, Ok(value.clone()));
                }
            }
            SourceMessage::ResponseError {
                channels,
                response_key,
                error,
            } => {
                for id in channels {
                    self.settle(&id, response_key, Err(Error::from_value(&error)));
                }
            }
            SourceMessage::State { channels, value } => {
                for id in channels {
                    if let Some(shared) = self.registry.get(&id) {
                        shared.apply_state(value.clone());
                    }
                }
            }
            SourceMessage::Close { channels, reason } => {
                for id in channels {
                    self.close_channel(&id, reason.clone(), false);
                }
            }
            SourceMessage::Event {
                channels,
                path,
                args,
            } => {
                let key = event_path_key(&path);
                for id in channels {
                    if let Some(shared) = self.registry.get(&id) {
                        shared.hub.emit(&key, &args);
                    }
                }
            }
        }
    }

    fn settle(&mut self, id: &ChannelId, response_key: u64, result: Result<Value, Error>) {
        let Some(calls) = self.pending.get_mut(id) else {
            tracing::warn!(%id, response_key, "response for unknown channel");
            return;
        };
        match calls.remove(&response_key) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::warn!(%id, response_key, "response for unknown call"),
        }
        if calls.is_empty() {
            self.pending.remove(id);
        }
    }

    fn close_channel(&mut self, id: &ChannelId, reason: Value, notify_peer: bool) {
        if let Some(shared) = self.registry.remove(id) {
            shared.close_local(&reason);
            if notify_peer {
                self.send(ClientMessage::Close {
                    channel: id.clone(),
                    reason: reason.clone(),
                });
            }
        }
        self.reject_pending(id, &reason);
    }

    fn reject_pending(&mut self, id: &ChannelId, reason: &Value) {
        if let Some(calls) = self.pending.remove(id) {
            let error = Error::from_value(reason);
            for (_, reply) in calls {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }

    fn shutdown(&mut self, reason: Value) {
        for (_, shared) in self.registry.drain() {
            shared.close_local(&reason);
        }
        let pending = std::mem::take(&mut self.pending);
        let error = Error::from_value(&reason);
        for (_, calls) in pending {
            for (_, reply) in calls {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }

    fn send(&self, message: ClientMessage) {
        tracing::trace!(?message, "send");
        if self.outgoing_tx.unbounded_send(message.encode()).is_err() {
            tracing::trace!("link gone; dropping outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_and_path_keys_do_not_collide() {
        assert_eq!("ready".into_event_key(), "ready");
        assert_eq!("state".into_event_key(), "state");
        assert_eq!("custom".into_event_key(), r#"["custom"]"#);
        assert_eq!(["a", "b"].into_event_key(), r#"["a","b"]"#);
        // A remote event named "state" is addressed by path.
        assert_eq!(["state"].into_event_key(), r#"["state"]"#);
    }

    #[test]
    fn random_ids_are_16_chars() {
        match random_channel_id() {
            ChannelId::Str(id) => assert_eq!(id.len(), 16),
            ChannelId::Num(_) => panic!("expected a string id"),
        }
    }
}
