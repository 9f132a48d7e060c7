//! One logical broadcast channel and the state it owns.
//!
//! A [`ProtocolRegistration`] is synchronous. It never spawns or awaits anything. The
//! [`CausalBroadcast`](crate::CausalBroadcast) event loop owns every registration and drives it with inbound
//! envelopes, timer ticks, and application sends, one at a time. The same type can be driven by hand through a
//! [`ProtocolRegistry`](crate::ProtocolRegistry), which is how deterministic simulations and tests use it.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};

use crate::{
    anti_entropy::{response_chunks, AntiEntropyObserved, Assemblies, ChunkOutcome, History},
    buffer::{DeliveryBuffer, Message, Review},
    causality::CausalityOracle,
    codec::{self, Envelope},
    config::{AntiEntropyScope, BroadcastConfig},
    error::{CodecError, DeliveryError},
    gossip::Disseminator,
    message::{AntiEntropyChunk, AntiEntropyRequest, BroadcastMessage, MessageKind, ProtocolId},
    overlay::{PeerId, PeerSampling},
    subscription::{SharedSubscribers, SubscriptionId},
};

/// Application payloads a registration can carry.
///
/// Implemented for every type that can be cloned, sent across threads, and serialized.
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Clone + Serialize + DeserializeOwned + Send + 'static {}

/// Counters describing what a registration has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistrationStats {
    /// Local messages sent.
    pub sent: u64,
    /// Remote messages handed to the application.
    pub delivered: u64,
    /// Messages currently waiting for their causal dependencies.
    pub buffered: usize,
    /// Inbound messages rejected because they were already delivered or buffered.
    pub duplicates_suppressed: u64,
    /// Anti-entropy rounds started.
    pub anti_entropy_rounds: u64,
    /// Delivered messages retained to answer anti-entropy requests.
    pub history: usize,
}

/// Causal broadcast state of one protocol: oracle, delivery buffer, delivered history, partial anti-entropy
/// responses, and subscribers.
pub struct ProtocolRegistration<O: CausalityOracle, P> {
    protocol_id: ProtocolId,
    oracle: O,
    buffer: DeliveryBuffer<O, P>,
    history: History<Message<O, P>>,
    assemblies: Assemblies<O::Snapshot, Message<O, P>>,
    gossip: Disseminator,
    scope: AntiEntropyScope,
    on_deliver: SharedSubscribers<P>,
    on_anti_entropy: SharedSubscribers<AntiEntropyObserved<O::Snapshot>>,
    stats: RegistrationStats,
}

impl<O, P> ProtocolRegistration<O, P>
where
    O: CausalityOracle,
    P: Payload,
{
    /// Creates a registration owning `oracle`.
    pub fn new(protocol_id: impl Into<ProtocolId>, oracle: O, config: &BroadcastConfig) -> Self {
        ProtocolRegistration {
            protocol_id: protocol_id.into(),
            oracle,
            buffer: DeliveryBuffer::new(),
            history: History::new(config.history_limit),
            assemblies: Assemblies::new(),
            gossip: Disseminator::new(config),
            scope: config.anti_entropy_scope,
            on_deliver: SharedSubscribers::new(),
            on_anti_entropy: SharedSubscribers::new(),
            stats: RegistrationStats::default(),
        }
    }

    /// The protocol this registration serves.
    pub fn protocol_id(&self) -> &ProtocolId {
        &self.protocol_id
    }

    /// The causality oracle, for inspection.
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Current counters.
    pub fn stats(&self) -> RegistrationStats {
        RegistrationStats {
            buffered: self.buffer.len(),
            history: self.history.len(),
            ..self.stats
        }
    }

    /// Subscribes to payloads delivered in causal order.
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

    /// Removes a handler added by [`on_deliver`](Self::on_deliver) or [`on_anti_entropy`](Self::on_anti_entropy).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.on_deliver.lock().unsubscribe(id) || self.on_anti_entropy.lock().unsubscribe(id)
    }

    pub(crate) fn deliver_subscribers(&self) -> SharedSubscribers<P> {
        self.on_deliver.clone()
    }

    pub(crate) fn anti_entropy_subscribers(&self) -> SharedSubscribers<AntiEntropyObserved<O::Snapshot>> {
        self.on_anti_entropy.clone()
    }

    /// Stamps `payload` with causal metadata and pushes it to the neighbors.
    ///
    /// The local node counts as having delivered its own message, so local subscribers are not called.
    pub fn broadcast(&mut self, payload: P, overlay: &dyn PeerSampling) -> Result<O::Id, CodecError> {
        // a payload that fails to encode must not consume an identifier
        codec::encode(&payload)?;

        let ready = self.oracle.dependencies();
        let id = self.oracle.increment();
        let message = BroadcastMessage {
            id: id.clone(),
            ready,
            payload,
        };
        let envelope = Envelope::seal(self.protocol_id.clone(), MessageKind::Broadcast, &message)?;
        self.history.push(message);
        self.stats.sent += 1;

        let count = self.gossip.push(overlay, &envelope);
        debug!(protocol_id = %self.protocol_id, ?id, count, "broadcast message");
        Ok(id)
    }

    /// Handles a gossiped message: filters duplicates, buffers it, delivers whatever became ready, then relays the
    /// original envelope.
    pub fn receive_broadcast(
        &mut self,
        from: &PeerId,
        message: Message<O, P>,
        envelope: &Envelope,
        overlay: &dyn PeerSampling,
    ) -> Result<(), DeliveryError> {
        if !self.accept(message) {
            trace!(protocol_id = %self.protocol_id, %from, "suppressed duplicate broadcast");
            return Ok(());
        }

        let review = self.review();
        let count = self.gossip.push(overlay, envelope);
        trace!(protocol_id = %self.protocol_id, %from, count, "relayed broadcast");
        review.map(drop)
    }

    /// Answers an anti-entropy request with every delivered message the requester's causal state does not cover.
    pub fn receive_request(
        &mut self,
        from: &PeerId,
        request: AntiEntropyRequest<O::Snapshot>,
        overlay: &dyn PeerSampling,
    ) -> Result<(), CodecError> {
        let local = self.oracle.snapshot();
        let missing: Vec<_> = self
            .history
            .iter()
            .filter(|message| !O::has_observed(&request.causality, &message.id))
            .cloned()
            .collect();

        self.on_anti_entropy.emit(&AntiEntropyObserved {
            peer: from.clone(),
            remote: request.causality,
            local: local.clone(),
        });

        let stream_id: u64 = rand::random();
        debug!(
            protocol_id = %self.protocol_id,
            peer = %from,
            stream_id,
            count = missing.len(),
            "answering anti-entropy request"
        );
        for chunk in response_chunks(stream_id, local, missing) {
            let envelope = Envelope::seal(self.protocol_id.clone(), MessageKind::AntiEntropyResponse, &chunk)?;
            self.gossip.unicast(overlay, from, envelope);
        }
        Ok(())
    }

    /// Feeds one chunk of an anti-entropy response. Once the response is complete, its elements go through the
    /// duplicate filter and the delivery buffer, then the responder's causal state is merged.
    pub fn receive_response(
        &mut self,
        from: &PeerId,
        chunk: AntiEntropyChunk<O::Snapshot, Message<O, P>>,
    ) -> Result<(), DeliveryError> {
        let (causality, elements) = match self.assemblies.accept(from, chunk) {
            ChunkOutcome::Pending => return Ok(()),
            ChunkOutcome::Complete(done) => {
                debug!(
                    protocol_id = %self.protocol_id,
                    peer = %from,
                    stream_id = done.stream_id,
                    count = done.elements.len(),
                    "anti-entropy response complete"
                );
                (done.causality, done.elements)
            }
            ChunkOutcome::Late { causality, element } => (causality, element.into_iter().collect()),
        };

        for element in elements {
            self.accept(element);
        }
        self.review()?;

        if let Some(causality) = causality {
            self.oracle.merge(&causality);
            // the merge may satisfy predicates of buffered messages
            self.review()?;
        }
        Ok(())
    }

    /// Sends the local causal state to one random neighbor, or to every neighbor with
    /// [`AntiEntropyScope::AllNeighbors`]. Returns the number of requests sent.
    pub fn anti_entropy_round(&mut self, overlay: &dyn PeerSampling) -> Result<usize, CodecError> {
        self.stats.anti_entropy_rounds += 1;
        let targets = match self.scope {
            AntiEntropyScope::RandomNeighbor => self.gossip.random_target(overlay).into_iter().collect(),
            AntiEntropyScope::AllNeighbors => self.gossip.targets(overlay),
        };
        if targets.is_empty() {
            trace!(protocol_id = %self.protocol_id, "no neighbor for anti-entropy");
            return Ok(0);
        }

        let request = AntiEntropyRequest {
            causality: self.oracle.snapshot(),
        };
        let envelope = Envelope::seal(self.protocol_id.clone(), MessageKind::AntiEntropyRequest, &request)?;
        for peer in &targets {
            debug!(protocol_id = %self.protocol_id, %peer, "requesting anti-entropy");
            self.gossip.unicast(overlay, peer, envelope.clone());
        }
        Ok(targets.len())
    }

    /// Forgets any partial anti-entropy response from a disconnected neighbor.
    pub fn peer_closed(&mut self, peer: &PeerId) {
        self.assemblies.forget(peer);
    }

    /// Runs the duplicate filter and buffers the message if it passes.
    fn accept(&mut self, message: Message<O, P>) -> bool {
        if !self.buffer.should_process(&self.oracle, &message.id) {
            self.stats.duplicates_suppressed += 1;
            return false;
        }
        self.buffer.insert(message)
    }

    fn review(&mut self) -> Result<Review, DeliveryError> {
        let subscribers = &self.on_deliver;
        let history = &mut self.history;
        let review = self.buffer.review(&mut self.oracle, |message| {
            subscribers.emit(&message.payload);
            history.push(message);
        })?;

        self.stats.delivered += review.delivered as u64;
        if review.delivered > 0 || review.dropped > 0 {
            trace!(
                protocol_id = %self.protocol_id,
                delivered = review.delivered,
                dropped = review.dropped,
                passes = review.passes,
                buffered = self.buffer.len(),
                "reviewed delivery buffer"
            );
        }
        Ok(review)
    }
}

impl<O: CausalityOracle, P> fmt::Debug for ProtocolRegistration<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistration")
            .field("protocol_id", &self.protocol_id)
            .field("buffered", &self.buffer.len())
            .field("history", &self.history.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
