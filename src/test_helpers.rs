use std::sync::Mutex;

use crate::{
    codec::Envelope,
    overlay::{PeerId, PeerSampling},
};

/// Overlay stub that records every send instead of transmitting it.
#[derive(Default)]
pub(crate) struct RecordingOverlay {
    peers: Mutex<Vec<PeerId>>,
    sent: Mutex<Vec<(PeerId, Envelope, u32)>>,
    ignore_fanout: bool,
}

impl RecordingOverlay {
    pub(crate) fn with_peers<const N: usize>(peers: [&str; N]) -> Self {
        RecordingOverlay {
            peers: Mutex::new(peers.into_iter().map(PeerId::from).collect()),
            ..Default::default()
        }
    }

    /// Returns every neighbor from `get_peers`, whatever fanout is asked for.
    pub(crate) fn ignoring_fanout(mut self) -> Self {
        self.ignore_fanout = true;
        self
    }

    pub(crate) fn take_sent(&self) -> Vec<(PeerId, Envelope, u32)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl PeerSampling for RecordingOverlay {
    fn get_peers(&self, fanout: Option<usize>) -> Vec<PeerId> {
        let peers = self.peers.lock().unwrap().clone();
        match fanout {
            Some(fanout) if !self.ignore_fanout => peers.into_iter().take(fanout).collect(),
            _ => peers,
        }
    }

    fn send(&self, peer: &PeerId, envelope: Envelope, retry: u32) {
        self.sent.lock().unwrap().push((peer.clone(), envelope, retry));
    }
}
