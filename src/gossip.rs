//! Epidemic dissemination through the overlay.
//!
//! There is no hop count: every node relays each message it accepts for the first time, and the duplicate filter at
//! every node stops the flood.

use rand::{seq::SliceRandom, thread_rng};
use tracing::trace;

use crate::{
    codec::Envelope,
    config::BroadcastConfig,
    overlay::{PeerId, PeerSampling},
};

/// Picks neighbors and pushes envelopes to them.
#[derive(Clone, Copy, Debug)]
pub struct Disseminator {
    fanout: Option<usize>,
    retry: u32,
}

impl Disseminator {
    /// Creates a disseminator using the fanout and retry budget of `config`.
    pub fn new(config: &BroadcastConfig) -> Self {
        Disseminator {
            fanout: config.fanout,
            retry: config.retry,
        }
    }

    /// Returns the neighbors a message should be pushed to.
    ///
    /// The overlay is asked for a snapshot of at most `fanout` neighbors. If it returns more, a uniformly random
    /// subset of `fanout` is kept.
    pub fn targets(&self, overlay: &dyn PeerSampling) -> Vec<PeerId> {
        let peers = overlay.get_peers(self.fanout);
        match self.fanout {
            Some(fanout) if peers.len() > fanout => peers
                .choose_multiple(&mut thread_rng(), fanout)
                .cloned()
                .collect(),
            _ => peers,
        }
    }

    /// Returns one neighbor chosen uniformly at random, if any.
    pub fn random_target(&self, overlay: &dyn PeerSampling) -> Option<PeerId> {
        overlay.get_peers(self.fanout).choose(&mut thread_rng()).cloned()
    }

    /// Pushes `envelope` to every target and returns how many neighbors it was handed to.
    pub fn push(&self, overlay: &dyn PeerSampling, envelope: &Envelope) -> usize {
        let targets = self.targets(overlay);
        for peer in &targets {
            trace!(%peer, protocol_id = %envelope.protocol_id, "pushing envelope");
            overlay.send(peer, envelope.clone(), self.retry);
        }
        targets.len()
    }

    /// Sends `envelope` to a single neighbor.
    pub fn unicast(&self, overlay: &dyn PeerSampling, peer: &PeerId, envelope: Envelope) {
        overlay.send(peer, envelope, self.retry);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{message::MessageKind, test_helpers::RecordingOverlay};

    fn envelope() -> Envelope {
        Envelope::seal("chat".into(), MessageKind::Broadcast, &1u8).unwrap()
    }

    #[test]
    fn pushes_to_every_neighbor_by_default() {
        let overlay = RecordingOverlay::with_peers(["a", "b", "c"]);
        let gossip = Disseminator::new(&BroadcastConfig::default().with_retry(2));

        assert_eq!(gossip.push(&overlay, &envelope()), 3);

        let sent = overlay.take_sent();
        let peers: HashSet<_> = sent.iter().map(|(peer, _, _)| peer.as_str().to_owned()).collect();
        assert_eq!(peers.len(), 3);
        assert!(sent.iter().all(|(_, _, retry)| *retry == 2));
    }

    #[test]
    fn fanout_bounds_targets_even_if_overlay_returns_more() {
        let overlay = RecordingOverlay::with_peers(["a", "b", "c", "d", "e"]).ignoring_fanout();
        let gossip = Disseminator::new(&BroadcastConfig::default().with_fanout(2));

        let targets = gossip.targets(&overlay);
        assert_eq!(targets.len(), 2);
        assert_ne!(targets[0], targets[1]);
    }

    #[test]
    fn no_neighbors_means_no_sends() {
        let overlay = RecordingOverlay::default();
        let gossip = Disseminator::new(&BroadcastConfig::default());

        assert_eq!(gossip.push(&overlay, &envelope()), 0);
        assert!(gossip.random_target(&overlay).is_none());
        assert!(overlay.take_sent().is_empty());
    }
}
