//! Wire message types exchanged between registrations of the same protocol.
//!
//! Every message travels inside an [`Envelope`](crate::codec::Envelope) that names the protocol and the
//! [`MessageKind`]. The types here are the envelope bodies. They are generic over the causality oracle's identifier,
//! predicate, and snapshot types so that each registration can bring its own causality tracking structure.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Identifier of a logical broadcast channel multiplexed over one overlay.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Creates a protocol id.
    pub fn new(id: impl Into<String>) -> Self {
        ProtocolId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        ProtocolId(id.to_owned())
    }
}

impl From<String> for ProtocolId {
    fn from(id: String) -> Self {
        ProtocolId(id)
    }
}

impl Borrow<str> for ProtocolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The three kinds of message a registration understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A gossiped application payload.
    Broadcast = 0,
    /// A request for the messages the sender is missing.
    AntiEntropyRequest = 1,
    /// One chunk of the answer to an anti-entropy request.
    AntiEntropyResponse = 2,
}

impl MessageKind {
    /// Returns the one byte tag used on the wire.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Broadcast),
            1 => Ok(MessageKind::AntiEntropyRequest),
            2 => Ok(MessageKind::AntiEntropyResponse),
            other => Err(other),
        }
    }
}

/// An application payload stamped with causal metadata.
///
/// `id` is minted by the origin's causality oracle and `ready` is the dependency descriptor a receiving oracle must
/// satisfy before the payload may be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage<I, R, P> {
    /// Causal identifier of the message.
    pub id: I,
    /// Readiness predicate checked before delivery.
    pub ready: R,
    /// Application payload.
    pub payload: P,
}

/// Asks a neighbor for every message the attached causal state does not cover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyRequest<S> {
    /// Requester's causal state when the request was built.
    pub causality: S,
}

/// One chunk of an anti-entropy response.
///
/// A response is a stream of chunks sharing `stream_id`: exactly one chunk carries the responder's causal state, and
/// each of the others carries one missing element. Every chunk repeats `total`, the number of elements in the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyChunk<S, M> {
    /// Ties the chunks of one logical response together.
    pub stream_id: u64,
    /// Number of elements the complete response carries.
    pub total: usize,
    /// Responder's causal state, present on the header chunk only.
    pub causality: Option<S>,
    /// One missing message, absent on the header chunk.
    pub element: Option<M>,
}

impl<S, M> AntiEntropyChunk<S, M> {
    /// Builds the header chunk of a stream.
    pub fn header(stream_id: u64, total: usize, causality: S) -> Self {
        AntiEntropyChunk {
            stream_id,
            total,
            causality: Some(causality),
            element: None,
        }
    }

    /// Builds an element chunk of a stream.
    pub fn element(stream_id: u64, total: usize, element: M) -> Self {
        AntiEntropyChunk {
            stream_id,
            total,
            causality: None,
            element: Some(element),
        }
    }
}
