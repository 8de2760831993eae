//! The Source-side endpoint: one driver loop per link.
//!
//! The loop decodes client messages, owns the channel registry and the
//! per-source subscriber map, runs handler futures concurrently, and fans
//! state/event/close broadcasts out to subscriber groups. All registry
//! mutation happens on the loop, so a link never races against itself;
//! handles and source listeners reach the loop through an unbounded event
//! channel.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt as _;
use futures_concurrency::stream::StreamExt as _;
use fxhash::FxHashMap;
use serde_json::json;

use crate::error::Error;
use crate::source::{Outcome, Source, SourceNotice};
use crate::source_channel::SourceChannel;
use crate::transport::{Link, LinkChannels, LinkEvent};
use crate::wire::{ChannelId, ClientMessage, Path, SourceMessage, Value, WireMessage};

/// Hook invoked for every newly created source channel, with its parent
/// channel when it was opened through one.
pub type ChannelHook = Arc<dyn Fn(&SourceChannel, Option<&SourceChannel>) + Send + Sync>;

/// Configuration for [`serve`].
#[derive(Clone, Default)]
pub struct SourceOptions {
    max_channels: Option<usize>,
    context: Value,
    on_channel: Option<ChannelHook>,
}

impl SourceOptions {
    pub fn new() -> Self {
        SourceOptions::default()
    }

    /// Reject channel initialization beyond this many live channels on the
    /// link. Unbounded by default.
    pub fn max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    /// Opaque value attached to every source channel on this link,
    /// typically the transport identity.
    pub fn context(mut self, context: impl Into<Value>) -> Self {
        self.context = context.into();
        self
    }

    /// Observe every newly created source channel (root or child) before it
    /// is initialized. The extension point for audit and policy code.
    pub fn on_channel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SourceChannel, Option<&SourceChannel>) + Send + Sync + 'static,
    {
        self.on_channel = Some(Arc::new(hook));
        self
    }
}

/// Serve `root` on one link. Resolves when the link closes.
pub async fn serve(
    root: Source,
    link: impl Link + 'static,
    options: SourceOptions,
) -> Result<(), Error> {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
    let (incoming_tx, incoming_rx) = mpsc::unbounded();
    let (driver_tx, driver_rx) = mpsc::unbounded();

    let transport = Box::new(link).run(LinkChannels {
        outgoing_rx,
        incoming_tx,
    });
    let driver = SourceDriver {
        root,
        options,
        outgoing_tx,
        driver_tx,
        channels: FxHashMap::default(),
        subscribers: FxHashMap::default(),
    };
    futures::try_join!(transport, driver.run(incoming_rx, driver_rx))?;
    Ok(())
}

/// Events reaching the driver loop from handles, source listeners, and
/// in-flight handler futures.
pub(crate) enum DriverEvent {
    /// A subscribed source published a notice.
    Notice { source_id: u64, notice: SourceNotice },
    /// A channel handle emitted a single-recipient event.
    ChannelEmit {
        channel_id: ChannelId,
        path: Path,
        args: Vec<Value>,
    },
    /// A channel handle closed; clean up registry and subscriber state.
    ChannelClosed {
        channel_id: ChannelId,
        source_id: u64,
        reason: Value,
        notify_peer: bool,
    },
    /// A CALL handler future resolved.
    CallDone {
        channel_id: ChannelId,
        response_key: u64,
        result: Result<Outcome, Error>,
    },
    /// A CREATE handler future resolved.
    CreateDone {
        parent: SourceChannel,
        new_channel: ChannelId,
        result: Result<Outcome, Error>,
    },
    /// A NOTIFY handler future resolved; result already discarded.
    NotifyDone,
}

struct SubscriberEntry {
    source: Source,
    channel_ids: Vec<ChannelId>,
    listener: u64,
}

struct SourceDriver {
    root: Source,
    options: SourceOptions,
    outgoing_tx: mpsc::UnboundedSender<WireMessage>,
    driver_tx: mpsc::UnboundedSender<DriverEvent>,
    channels: FxHashMap<ChannelId, SourceChannel>,
    subscribers: FxHashMap<u64, SubscriberEntry>,
}

enum Ev {
    Link(LinkEvent),
    LinkEnded,
    Driver(DriverEvent),
}

impl SourceDriver {
    async fn run(
        mut self,
        incoming_rx: mpsc::UnboundedReceiver<LinkEvent>,
        driver_rx: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> Result<(), Error> {
        // UFCS for `chain`: both StreamExt traits in scope provide one.
        let incoming = futures::StreamExt::chain(
            incoming_rx.map(Ev::Link),
            futures::stream::once(futures::future::ready(Ev::LinkEnded)),
        );
        let merged = incoming.merge(driver_rx.map(Ev::Driver));
        let mut merged = merged.fuse();
        futures::pin_mut!(merged);
        let mut tasks: FuturesUnordered<BoxFuture<'static, DriverEvent>> = FuturesUnordered::new();

        loop {
            let event = futures::select! {
                event = merged.next() => match event {
                    Some(event) => event,
                    None => Ev::LinkEnded,
                },
                event = tasks.select_next_some() => Ev::Driver(event),
            };
            match event {
                Ev::Link(LinkEvent::Message(raw)) => self.handle_message(raw, &mut tasks),
                Ev::Link(LinkEvent::Closed(reason)) => {
                    tracing::debug!(?reason, "link closed");
                    self.close_all(reason);
                    return Ok(());
                }
                Ev::LinkEnded => {
                    tracing::debug!("link ended without close");
                    self.close_all(json!("connection closed"));
                    return Ok(());
                }
                Ev::Driver(event) => self.handle_driver_event(event),
            }
        }
    }

    fn handle_message(
        &mut self,
        raw: WireMessage,
        tasks: &mut FuturesUnordered<BoxFuture<'static, DriverEvent>>,
    ) {
        let Some(message) = ClientMessage::decode(&raw) else {
            tracing::warn!(?raw, "ignoring malformed client message");
            return;
        };
        match message {
            ClientMessage::Init { channel } => {
                tracing::trace!(%channel, "initialize root channel");
                let ch = SourceChannel::new(self.root.clone());
                if let Some(hook) = &self.options.on_channel {
                    hook(&ch, None);
                }
                if let Err(error) = self.initialize(ch, channel.clone()) {
                    self.send(SourceMessage::close_with(channel, &error));
                }
            }
            ClientMessage::Call {
                channel,
                response_key,
                path,
                args,
            } => match self.channels.get(&channel) {
                None => {
                    tracing::warn!(%channel, "call on unknown channel");
                    self.send(SourceMessage::close_with(channel, &Error::wrong_channel()));
                }
                Some(ch) => {
                    let handler = ch.source().handler();
                    let ch = ch.clone();
                    tasks.push(Box::pin(async move {
                        let result = handler.call(ch, path, args, false).await;
                        DriverEvent::CallDone {
                            channel_id: channel,
                            response_key,
                            result,
                        }
                    }));
                }
            },
            ClientMessage::Notify {
                channel,
                path,
                args,
            } => match self.channels.get(&channel) {
                None => {
                    self.send(SourceMessage::close_with(channel, &Error::wrong_channel()));
                }
                Some(ch) => {
                    let handler = ch.source().handler();
                    let ch = ch.clone();
                    tasks.push(Box::pin(async move {
                        if let Err(error) = handler.call(ch, path, args, false).await {
                            tracing::trace!(%error, "notify handler failed");
                        }
                        DriverEvent::NotifyDone
                    }));
                }
            },
            ClientMessage::Close { channel, reason } => {
                tracing::trace!(%channel, "peer closed channel");
                if let Some(ch) = self.channels.remove(&channel) {
                    self.remove_subscriber(ch.source().source_id(), &channel);
                    ch.close_local(reason);
                }
            }
            ClientMessage::Create {
                channel,
                new_channel,
                path,
                args,
            } => match self.channels.get(&channel) {
                None => {
                    tracing::warn!(%channel, "create on unknown channel");
                    self.send(SourceMessage::close_with(
                        channel,
                        &Error::wrong_channel(),
                    ));
                    self.send(SourceMessage::close_with(
                        new_channel,
                        &Error::wrong_channel(),
                    ));
                }
                Some(parent) => {
                    let handler = parent.source().handler();
                    let parent = parent.clone();
                    tasks.push(Box::pin(async move {
                        let result = handler.call(parent.clone(), path, args, true).await;
                        DriverEvent::CreateDone {
                            parent,
                            new_channel,
                            result,
                        }
                    }));
                }
            },
        }
    }

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Notice { source_id, notice } => {
                // A detached source may still have queued notices; drop them.
                let Some(entry) = self.subscribers.get(&source_id) else {
                    return;
                };
                let channels = entry.channel_ids.clone();
                match notice {
                    SourceNotice::State(value) => {
                        self.send(SourceMessage::State { channels, value });
                    }
                    SourceNotice::Event(path, args) => {
                        self.send(SourceMessage::Event {
                            channels,
                            path,
                            args,
                        });
                    }
                    SourceNotice::Dispose(reason) => {
                        tracing::debug!(source_id, ?reason, "source disposed; closing subscribers");
                        self.send(SourceMessage::Close {
                            channels: channels.clone(),
                            reason: reason.clone(),
                        });
                        for id in &channels {
                            if let Some(ch) = self.channels.remove(id) {
                                ch.close_local(reason.clone());
                            }
                        }
                        if let Some(entry) = self.subscribers.remove(&source_id) {
                            entry.source.unsubscribe_notices(entry.listener);
                        }
                    }
                }
            }
            DriverEvent::ChannelEmit {
                channel_id,
                path,
                args,
            } => {
                if self.channels.contains_key(&channel_id) {
                    self.send(SourceMessage::Event {
                        channels: vec![channel_id],
                        path,
                        args,
                    });
                }
            }
            DriverEvent::ChannelClosed {
                channel_id,
                source_id,
                reason,
                notify_peer,
            } => {
                if self.channels.remove(&channel_id).is_some() && notify_peer {
                    self.send(SourceMessage::Close {
                        channels: vec![channel_id.clone()],
                        reason,
                    });
                }
                self.remove_subscriber(source_id, &channel_id);
            }
            DriverEvent::CallDone {
                channel_id,
                response_key,
                result,
            } => {
                // The channel may have closed while the handler was pending.
                let Some(ch) = self.channels.get(&channel_id) else {
                    tracing::trace!(%channel_id, "dropping response for closed channel");
                    return;
                };
                if ch.closed() {
                    return;
                }
                let message = match result {
                    Ok(Outcome::Value(value)) => SourceMessage::ResponseOk {
                        channels: vec![channel_id],
                        response_key,
                        value,
                    },
                    Ok(_) => SourceMessage::ResponseError {
                        channels: vec![channel_id],
                        response_key,
                        error: Error::wrong_data_type().to_value(),
                    },
                    Err(error) => SourceMessage::ResponseError {
                        channels: vec![channel_id],
                        response_key,
                        error: error.to_value(),
                    },
                };
                self.send(message);
            }
            DriverEvent::CreateDone {
                parent,
                new_channel,
                result,
            } => {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        tracing::debug!(%new_channel, %error, "create handler failed");
                        self.send(SourceMessage::close_with(new_channel, &error));
                        return;
                    }
                };
                let ch = match outcome {
                    Outcome::Source {
                        source,
                        auto_dispose,
                    } => {
                        let ch = SourceChannel::new(source);
                        ch.set_auto_dispose(auto_dispose);
                        ch
                    }
                    Outcome::Channel(ch) => ch,
                    Outcome::Value(_) => {
                        self.send(SourceMessage::close_with(
                            new_channel,
                            &Error::wrong_data_type(),
                        ));
                        return;
                    }
                };
                if let Some(hook) = &self.options.on_channel {
                    hook(&ch, Some(&parent));
                }
                if let Err(error) = self.initialize(ch, new_channel.clone()) {
                    self.send(SourceMessage::close_with(new_channel, &error));
                }
            }
            DriverEvent::NotifyDone => {}
        }
    }

    /// Initialize a channel under `id`: enforce the channel limit, bind,
    /// detect id conflicts, reject disposed sources, subscribe, emit the
    /// initial state, and mark ready.
    fn initialize(&mut self, ch: SourceChannel, id: ChannelId) -> Result<(), Error> {
        if let Some(max) = self.options.max_channels {
            if self.channels.len() >= max {
                let error = Error::channels_limit();
                if ch.channel_id().is_none() {
                    ch.close_local(error.to_value());
                }
                return Err(error);
            }
        }
        ch.bind(id.clone(), self.options.context.clone(), self.driver_tx.clone())?;
        if let Some(prior) = self.channels.remove(&id) {
            let error = Error::channel_conflict();
            tracing::warn!(%id, "channel id conflict");
            self.send(SourceMessage::close_with(id.clone(), &error));
            self.remove_subscriber(prior.source().source_id(), &id);
            prior.close_local(error.to_value());
            ch.close_local(error.to_value());
            return Err(error);
        }
        let source = ch.source();
        if let Some(reason) = source.dispose_reason() {
            ch.close_local(reason.clone());
            return Err(Error::from_value(&reason));
        }

        let source_id = source.source_id();
        match self.subscribers.get_mut(&source_id) {
            Some(entry) => entry.channel_ids.push(id.clone()),
            None => {
                let driver_tx = self.driver_tx.clone();
                let listener = Arc::new(move |notice: &SourceNotice| {
                    let _ = driver_tx.unbounded_send(DriverEvent::Notice {
                        source_id,
                        notice: notice.clone(),
                    });
                });
                match source.subscribe_notices(listener) {
                    Some(listener_id) => {
                        self.subscribers.insert(
                            source_id,
                            SubscriberEntry {
                                source: source.clone(),
                                channel_ids: vec![id.clone()],
                                listener: listener_id,
                            },
                        );
                    }
                    None => {
                        // Disposed between the check above and here.
                        let reason = source.dispose_reason().unwrap_or(Value::Null);
                        ch.close_local(reason.clone());
                        return Err(Error::from_value(&reason));
                    }
                }
            }
        }

        self.channels.insert(id.clone(), ch.clone());
        self.send(SourceMessage::State {
            channels: vec![id.clone()],
            value: source.state(),
        });
        ch.mark_ready();
        tracing::debug!(%id, "channel ready");
        Ok(())
    }

    fn remove_subscriber(&mut self, source_id: u64, id: &ChannelId) {
        let emptied = match self.subscribers.get_mut(&source_id) {
            Some(entry) => {
                entry.channel_ids.retain(|channel_id| channel_id != id);
                entry.channel_ids.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(entry) = self.subscribers.remove(&source_id) {
                entry.source.unsubscribe_notices(entry.listener);
            }
        }
    }

    fn close_all(&mut self, reason: Value) {
        for (_, ch) in self.channels.drain() {
            ch.close_local(reason.clone());
        }
        for (_, entry) in self.subscribers.drain() {
            entry.source.unsubscribe_notices(entry.listener);
        }
    }

    fn send(&self, message: SourceMessage) {
        tracing::trace!(?message, "send");
        if self.outgoing_tx.unbounded_send(message.encode()).is_err() {
            tracing::trace!("link gone; dropping outbound message");
        }
    }
}
