//! The broadcast runtime: one event loop per node, owning every registration.
//!
//! [`CausalBroadcast::spawn`] starts a Tokio task running the event loop and returns a cheap, cloneable reference to
//! it. Registrations, application sends, overlay events, and anti-entropy ticks are commands on the loop's unbounded
//! mailbox and are handled one at a time, so a registration is never touched concurrently.
//!
//! The loop stops once every [`CausalBroadcast`] and [`BroadcastHandle`] is dropped. Anti-entropy timers only hold a
//! weak reference to the mailbox and never keep the loop alive.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use causal_broadcast::{
//!     BroadcastConfig, CausalBroadcast, Envelope, PeerId, PeerSampling, VersionVector,
//! };
//!
//! struct Lonely;
//!
//! impl PeerSampling for Lonely {
//!     fn get_peers(&self, _fanout: Option<usize>) -> Vec<PeerId> {
//!         Vec::new()
//!     }
//!
//!     fn send(&self, _peer: &PeerId, _envelope: Envelope, _retry: u32) {}
//! }
//!
//! # tokio_test::block_on(async {
//! let broadcast = CausalBroadcast::spawn(Arc::new(Lonely), BroadcastConfig::default());
//! let chat = broadcast
//!     .register::<_, String>("chat", VersionVector::new("alice"))
//!     .await?;
//!
//! chat.on_deliver(|message| println!("received {message}"));
//! chat.send("hello".to_string()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{collections::HashMap, fmt, marker::PhantomData, sync::Arc};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        oneshot, watch,
    },
    task::AbortHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    anti_entropy::{self, AntiEntropyObserved},
    causality::CausalityOracle,
    config::BroadcastConfig,
    error::{BroadcastError, RegistryError},
    message::ProtocolId,
    overlay::{OverlayEvent, PeerSampling},
    registration::{Payload, ProtocolRegistration, RegistrationStats},
    registry::{ProtocolRegistry, Route},
    subscription::{SharedSubscribers, SubscriptionId},
};

type Operation = Box<dyn FnOnce(&mut ProtocolRegistry, &dyn PeerSampling) + Send>;

enum Command {
    Register {
        route: Box<dyn Route>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Unregister {
        protocol_id: ProtocolId,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Apply(Operation),
    Overlay(OverlayEvent),
    AntiEntropyTick(ProtocolId),
}

/// Reference to a running broadcast event loop.
#[derive(Clone)]
pub struct CausalBroadcast {
    mailbox: UnboundedSender<Command>,
    config: Arc<BroadcastConfig>,
}

impl CausalBroadcast {
    /// Spawns the event loop on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn(overlay: Arc<dyn PeerSampling>, config: BroadcastConfig) -> Self {
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let (joined, _) = watch::channel(false);
        let event_loop = EventLoop {
            registry: ProtocolRegistry::new(),
            overlay,
            config: config.clone(),
            joined,
            timers: HashMap::new(),
            mailbox: mailbox.downgrade(),
        };
        tokio::spawn(event_loop.run(mailbox_rx));

        CausalBroadcast { mailbox, config }
    }

    /// The configuration shared by every registration.
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Returns `true` while the event loop is running.
    pub fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Registers a protocol, handing it `oracle`, and starts its anti-entropy timer.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`] if `protocol_id` is taken. The existing registration is left
    /// untouched.
    pub async fn register<O, P>(
        &self,
        protocol_id: impl Into<ProtocolId>,
        oracle: O,
    ) -> Result<BroadcastHandle<O, P>, RegistryError>
    where
        O: CausalityOracle,
        P: Payload,
    {
        let registration = ProtocolRegistration::<O, P>::new(protocol_id, oracle, &self.config);
        let handle = BroadcastHandle {
            protocol_id: registration.protocol_id().clone(),
            mailbox: self.mailbox.clone(),
            on_deliver: registration.deliver_subscribers(),
            on_anti_entropy: registration.anti_entropy_subscribers(),
            oracle: PhantomData,
        };

        let (reply, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Command::Register {
                route: Box::new(registration),
                reply,
            })
            .map_err(|_| RegistryError::Stopped)?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)??;

        Ok(handle)
    }

    /// Unregisters a protocol, stopping its timer and dropping its oracle and buffer.
    ///
    /// Messages for the protocol that arrive afterwards are reported as routing errors and discarded.
    pub async fn unregister(&self, protocol_id: impl Into<ProtocolId>) -> Result<(), RegistryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Command::Unregister {
                protocol_id: protocol_id.into(),
                reply,
            })
            .map_err(|_| RegistryError::Stopped)?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)?
    }

    /// Feeds something the overlay observed into the event loop.
    ///
    /// This is the only inbound path: the overlay calls it for connections, disconnections, its join signal, and
    /// every envelope it receives.
    pub fn overlay_event(&self, event: OverlayEvent) -> Result<(), BroadcastError> {
        self.mailbox
            .send(Command::Overlay(event))
            .map_err(|_| BroadcastError::Stopped)
    }
}

impl fmt::Debug for CausalBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalBroadcast")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Application-facing handle of one registration.
pub struct BroadcastHandle<O: CausalityOracle, P> {
    protocol_id: ProtocolId,
    mailbox: UnboundedSender<Command>,
    on_deliver: SharedSubscribers<P>,
    on_anti_entropy: SharedSubscribers<AntiEntropyObserved<O::Snapshot>>,
    oracle: PhantomData<fn() -> O>,
}

impl<O, P> BroadcastHandle<O, P>
where
    O: CausalityOracle,
    P: Payload,
{
    /// The protocol this handle sends on.
    pub fn protocol_id(&self) -> &ProtocolId {
        &self.protocol_id
    }

    /// Broadcasts `payload` to every node of the protocol and returns the identifier it was stamped with.
    pub async fn send(&self, payload: P) -> Result<O::Id, BroadcastError> {
        self.apply(move |registration, overlay| {
            registration
                .broadcast(payload, overlay)
                .map_err(BroadcastError::from)
        })
        .await
    }

    /// Returns the registration's counters.
    pub async fn stats(&self) -> Result<RegistrationStats, BroadcastError> {
        self.apply(|registration, _| Ok(registration.stats())).await
    }

    /// Subscribes to payloads delivered in causal order. Handlers run on the event loop and should return quickly.
    /// A handler may subscribe or unsubscribe through this handle, including removing itself after one payload.
    pub fn on_deliver<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&P) + Send + 'static,
    {
        self.on_deliver.lock().subscribe(handler)
    }

    /// Subscribes to anti-entropy requests received from neighbors.
    pub fn on_anti_entropy<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&AntiEntropyObserved<O::Snapshot>) + Send + 'static,
    {
        self.on_anti_entropy.lock().subscribe(handler)
    }

    /// Removes a handler. Returns `false` if it was not subscribed through this handle.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.on_deliver.lock().unsubscribe(id) || self.on_anti_entropy.lock().unsubscribe(id)
    }

    async fn apply<T, F>(&self, f: F) -> Result<T, BroadcastError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProtocolRegistration<O, P>, &dyn PeerSampling) -> Result<T, BroadcastError>
            + Send
            + 'static,
    {
        let (reply, reply_rx) = oneshot::channel();
        let protocol_id = self.protocol_id.clone();
        let operation: Operation = Box::new(move |registry, overlay| {
            let result = match registry.get_mut::<O, P>(&protocol_id) {
                Some(registration) => f(registration, overlay),
                None => Err(BroadcastError::NotRegistered(protocol_id)),
            };
            let _ = reply.send(result);
        });

        self.mailbox
            .send(Command::Apply(operation))
            .map_err(|_| BroadcastError::Stopped)?;
        reply_rx.await.map_err(|_| BroadcastError::Stopped)?
    }
}

impl<O: CausalityOracle, P> Clone for BroadcastHandle<O, P> {
    fn clone(&self) -> Self {
        BroadcastHandle {
            protocol_id: self.protocol_id.clone(),
            mailbox: self.mailbox.clone(),
            on_deliver: self.on_deliver.clone(),
            on_anti_entropy: self.on_anti_entropy.clone(),
            oracle: PhantomData,
        }
    }
}

impl<O: CausalityOracle, P> fmt::Debug for BroadcastHandle<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHandle")
            .field("protocol_id", &self.protocol_id)
            .finish_non_exhaustive()
    }
}

struct EventLoop {
    registry: ProtocolRegistry,
    overlay: Arc<dyn PeerSampling>,
    config: Arc<BroadcastConfig>,
    joined: watch::Sender<bool>,
    timers: HashMap<ProtocolId, AbortHandle>,
    mailbox: WeakUnboundedSender<Command>,
}

impl EventLoop {
    async fn run(mut self, mut mailbox_rx: UnboundedReceiver<Command>) {
        trace!("broadcast event loop started");
        while let Some(command) = mailbox_rx.recv().await {
            self.handle(command);
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        debug!(registrations = self.registry.len(), "broadcast event loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { route, reply } => {
                let protocol_id = route.protocol_id().clone();
                let result = self.registry.insert_route(route);
                if result.is_ok() {
                    self.start_timer(protocol_id);
                }
                let _ = reply.send(result);
            }
            Command::Unregister { protocol_id, reply } => {
                let result = self.registry.remove(&protocol_id);
                if let Some(timer) = self.timers.remove(&protocol_id) {
                    timer.abort();
                }
                let _ = reply.send(result);
            }
            Command::Apply(operation) => operation(&mut self.registry, &*self.overlay),
            Command::Overlay(event) => self.on_overlay_event(event),
            Command::AntiEntropyTick(protocol_id) => {
                if !self.registry.contains(&protocol_id) {
                    // queued before the registration was removed
                    trace!(%protocol_id, "skipping anti-entropy tick of unregistered protocol");
                    return;
                }
                if let Err(err) = self.registry.anti_entropy_round(&protocol_id, &*self.overlay) {
                    warn!(%protocol_id, "anti-entropy round failed: {err}");
                }
            }
        }
    }

    fn on_overlay_event(&mut self, event: OverlayEvent) {
        match event {
            OverlayEvent::Open(peer) => trace!(%peer, "neighbor connected"),
            OverlayEvent::Close(peer) => {
                trace!(%peer, "neighbor disconnected");
                self.registry.peer_closed(&peer);
            }
            OverlayEvent::Join => {
                debug!("joined the network");
                self.joined.send_replace(true);
            }
            OverlayEvent::Message { from, envelope } => {
                if let Err(err) = self.registry.dispatch(&from, &envelope, &*self.overlay) {
                    warn!(peer = %from, protocol_id = %envelope.protocol_id, "dropping inbound message: {err}");
                }
            }
        }
    }

    fn start_timer(&mut self, protocol_id: ProtocolId) {
        let mailbox = self.mailbox.clone();
        let tick_protocol_id = protocol_id.clone();
        let timer = anti_entropy::schedule_rounds(
            self.joined.subscribe(),
            self.config.join_grace,
            self.config.delta,
            move || match mailbox.upgrade() {
                Some(mailbox) => mailbox
                    .send(Command::AntiEntropyTick(tick_protocol_id.clone()))
                    .is_ok(),
                None => false,
            },
        );
        if let Some(previous) = self.timers.insert(protocol_id, timer) {
            previous.abort();
        }
    }
}
