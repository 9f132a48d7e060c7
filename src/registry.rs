//! Routing table multiplexing protocol registrations over one overlay.
//!
//! Inbound envelopes are routed by their protocol id to the matching registration and by their type tag to the
//! matching handler. Registrations of different protocols share nothing: each has its own oracle, buffer, and
//! subscribers, so traffic on one protocol can never be delivered on another.

use std::{
    any::Any,
    borrow::Borrow,
    collections::{
        hash_map::{self, Keys},
        HashMap,
    },
    fmt,
    hash::Hash,
};

use tracing::debug;

use crate::{
    causality::CausalityOracle,
    codec::Envelope,
    error::{CodecError, RegistryError, RoutingError},
    message::{MessageKind, ProtocolId},
    overlay::{PeerId, PeerSampling},
    registration::{Payload, ProtocolRegistration},
};

/// Type-erased view of a registration, as stored in the routing table.
pub trait Route: Send + 'static {
    /// The protocol the route serves.
    fn protocol_id(&self) -> &ProtocolId;

    /// Decodes and handles an envelope of a known kind.
    fn on_envelope(
        &mut self,
        from: &PeerId,
        kind: MessageKind,
        envelope: &Envelope,
        overlay: &dyn PeerSampling,
    ) -> Result<(), RoutingError>;

    /// Starts one anti-entropy round.
    fn anti_entropy_round(&mut self, overlay: &dyn PeerSampling) -> Result<(), RoutingError>;

    /// Reacts to a neighbor disconnecting.
    fn peer_closed(&mut self, peer: &PeerId);

    /// Returns the route as [`Any`], to recover the concrete registration.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

fn codec_error(protocol_id: &ProtocolId, kind: MessageKind) -> impl FnOnce(CodecError) -> RoutingError + '_ {
    move |source| RoutingError::Codec {
        protocol_id: protocol_id.clone(),
        kind,
        source,
    }
}

impl<O, P> Route for ProtocolRegistration<O, P>
where
    O: CausalityOracle,
    P: Payload,
{
    fn protocol_id(&self) -> &ProtocolId {
        ProtocolRegistration::protocol_id(self)
    }

    fn on_envelope(
        &mut self,
        from: &PeerId,
        kind: MessageKind,
        envelope: &Envelope,
        overlay: &dyn PeerSampling,
    ) -> Result<(), RoutingError> {
        let protocol_id = &envelope.protocol_id;
        match kind {
            MessageKind::Broadcast => {
                let message = envelope.open().map_err(codec_error(protocol_id, kind))?;
                self.receive_broadcast(from, message, envelope, overlay)?;
            }
            MessageKind::AntiEntropyRequest => {
                let request = envelope.open().map_err(codec_error(protocol_id, kind))?;
                self.receive_request(from, request, overlay)
                    .map_err(codec_error(protocol_id, MessageKind::AntiEntropyResponse))?;
            }
            MessageKind::AntiEntropyResponse => {
                let chunk = envelope.open().map_err(codec_error(protocol_id, kind))?;
                self.receive_response(from, chunk)?;
            }
        }
        Ok(())
    }

    fn anti_entropy_round(&mut self, overlay: &dyn PeerSampling) -> Result<(), RoutingError> {
        ProtocolRegistration::anti_entropy_round(self, overlay)
            .map(drop)
            .map_err(|source| RoutingError::Codec {
                protocol_id: ProtocolRegistration::protocol_id(self).clone(),
                kind: MessageKind::AntiEntropyRequest,
                source,
            })
    }

    fn peer_closed(&mut self, peer: &PeerId) {
        ProtocolRegistration::peer_closed(self, peer)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registrations of one broadcast instance, keyed by protocol id.
#[derive(Default)]
pub struct ProtocolRegistry {
    routes: HashMap<ProtocolId, Box<dyn Route>>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ProtocolRegistry {
            routes: HashMap::new(),
        }
    }

    /// An iterator visiting all registered protocol ids in arbitrary order.
    pub fn protocol_ids(&self) -> Keys<'_, ProtocolId, Box<dyn Route>> {
        self.routes.keys()
    }

    /// The number of registrations.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Returns `true` if a registration exists for `protocol_id`.
    pub fn contains<Q>(&self, protocol_id: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        ProtocolId: Borrow<Q>,
    {
        self.routes.contains_key(protocol_id)
    }

    /// Adds a registration.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`], leaving the registry unchanged, if its protocol id is taken.
    pub fn insert<O, P>(&mut self, registration: ProtocolRegistration<O, P>) -> Result<(), RegistryError>
    where
        O: CausalityOracle,
        P: Payload,
    {
        self.insert_route(Box::new(registration))
    }

    pub(crate) fn insert_route(&mut self, route: Box<dyn Route>) -> Result<(), RegistryError> {
        match self.routes.entry(route.protocol_id().clone()) {
            hash_map::Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            hash_map::Entry::Vacant(entry) => {
                debug!(protocol_id = %entry.key(), "protocol registered");
                entry.insert(route);
                Ok(())
            }
        }
    }

    /// Removes a registration, dropping its oracle, buffer, and subscribers.
    pub fn remove(&mut self, protocol_id: &ProtocolId) -> Result<(), RegistryError> {
        match self.routes.remove(protocol_id) {
            Some(_) => {
                debug!(%protocol_id, "protocol unregistered");
                Ok(())
            }
            None => Err(RegistryError::NotRegistered(protocol_id.clone())),
        }
    }

    /// Gets a registration with its concrete types.
    ///
    /// Returns `None` if nothing is registered under `protocol_id` or if it was registered with other types.
    pub fn get_mut<O, P>(&mut self, protocol_id: &ProtocolId) -> Option<&mut ProtocolRegistration<O, P>>
    where
        O: CausalityOracle,
        P: Payload,
    {
        self.routes
            .get_mut(protocol_id)
            .and_then(|route| route.as_any_mut().downcast_mut())
    }

    /// Routes an inbound envelope to its registration.
    pub fn dispatch(
        &mut self,
        from: &PeerId,
        envelope: &Envelope,
        overlay: &dyn PeerSampling,
    ) -> Result<(), RoutingError> {
        let route = self
            .routes
            .get_mut(&envelope.protocol_id)
            .ok_or_else(|| RoutingError::UnknownProtocol(envelope.protocol_id.clone()))?;
        let kind = envelope
            .kind()
            .map_err(|tag| RoutingError::UnhandledMessageType {
                protocol_id: envelope.protocol_id.clone(),
                tag,
            })?;
        route.on_envelope(from, kind, envelope, overlay)
    }

    /// Starts an anti-entropy round on one registration.
    pub fn anti_entropy_round(
        &mut self,
        protocol_id: &ProtocolId,
        overlay: &dyn PeerSampling,
    ) -> Result<(), RoutingError> {
        self.routes
            .get_mut(protocol_id)
            .ok_or_else(|| RoutingError::UnknownProtocol(protocol_id.clone()))?
            .anti_entropy_round(overlay)
    }

    /// Forwards a disconnection to every registration.
    pub fn peer_closed(&mut self, peer: &PeerId) {
        for route in self.routes.values_mut() {
            route.peer_closed(peer);
        }
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}
