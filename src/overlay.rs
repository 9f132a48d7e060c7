//! Interface to the peer-sampling overlay the broadcast runs on.
//!
//! The overlay discovers and maintains neighbors. Causal broadcast only reads neighbor snapshots and pushes
//! envelopes through the overlay's best-effort unicast primitive. Everything the overlay observes (connections,
//! disconnections, membership, inbound messages) is fed back as [`OverlayEvent`]s through
//! [`CausalBroadcast::overlay_event`](crate::CausalBroadcast::overlay_event).

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

use crate::codec::Envelope;

/// Identifier of a neighbor in the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id.
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A peer-sampling protocol providing a partial, changing view of the network.
pub trait PeerSampling: Send + Sync + 'static {
    /// Returns a snapshot of at most `fanout` connected neighbors, or all of them when `fanout` is `None`.
    fn get_peers(&self, fanout: Option<usize>) -> Vec<PeerId>;

    /// Sends an envelope to a neighbor.
    ///
    /// Delivery is best effort. The overlay may retry up to `retry` times and may drop the envelope silently if the
    /// neighbor disconnected.
    fn send(&self, peer: &PeerId, envelope: Envelope, retry: u32);
}

/// Something the overlay observed and reports to the broadcast.
#[derive(Clone, Debug)]
pub enum OverlayEvent {
    /// A connection to a neighbor opened.
    Open(PeerId),
    /// A connection to a neighbor closed.
    Close(PeerId),
    /// The local node joined the network.
    Join,
    /// An envelope arrived from a neighbor.
    Message {
        /// Neighbor that sent the envelope.
        from: PeerId,
        /// The envelope.
        envelope: Envelope,
    },
}
