use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use causal_broadcast::{
    AntiEntropyScope, BroadcastConfig, CausalBroadcast, Envelope, OverlayEvent, PeerId, PeerSampling, VersionVector,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Every node of the demo lives in this process. Envelopes go through their byte encoding anyway.
#[derive(Default)]
struct Switch {
    nodes: Mutex<HashMap<PeerId, CausalBroadcast>>,
    broken: Mutex<HashSet<(PeerId, PeerId)>>,
}

struct Port {
    id: PeerId,
    neighbors: Vec<PeerId>,
    switch: Arc<Switch>,
}

impl PeerSampling for Port {
    fn get_peers(&self, _fanout: Option<usize>) -> Vec<PeerId> {
        self.neighbors.clone()
    }

    fn send(&self, peer: &PeerId, envelope: Envelope, _retry: u32) {
        if self.switch.broken.lock().unwrap().contains(&(self.id.clone(), peer.clone())) {
            info!(from = %self.id, to = %peer, "link is down, envelope lost");
            return;
        }
        let Ok(bytes) = envelope.to_bytes() else {
            return;
        };
        let Ok(envelope) = Envelope::from_bytes(&bytes) else {
            return;
        };
        if let Some(node) = self.switch.nodes.lock().unwrap().get(peer) {
            let _ = node.overlay_event(OverlayEvent::Message {
                from: self.id.clone(),
                envelope,
            });
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .without_time()
        .with_target(false)
        .init();

    let config = BroadcastConfig::default()
        .with_join_grace(Duration::from_millis(200))
        .with_delta(Duration::from_secs(1))
        .with_anti_entropy_scope(AntiEntropyScope::AllNeighbors);

    // n1 - n2 - n3, with the link from n1 to n2 down
    let names = ["n1", "n2", "n3"];
    let switch = Arc::new(Switch::default());
    switch.broken.lock().unwrap().insert(("n1".into(), "n2".into()));

    let mut chats = Vec::new();
    for (index, name) in names.iter().enumerate() {
        let neighbors = names
            .iter()
            .enumerate()
            .filter(|(other, _)| other.abs_diff(index) == 1)
            .map(|(_, neighbor)| PeerId::from(*neighbor))
            .collect();
        let port = Port {
            id: PeerId::from(*name),
            neighbors,
            switch: switch.clone(),
        };
        let broadcast = CausalBroadcast::spawn(Arc::new(port), config.clone());
        let chat = broadcast
            .register::<_, String>("chat", VersionVector::new(*name))
            .await?;
        let node = name.to_string();
        chat.on_deliver(move |message| info!(%node, %message, "delivered"));

        switch.nodes.lock().unwrap().insert(PeerId::from(*name), broadcast);
        chats.push(chat);
    }

    chats[0].send("hi".to_string()).await?;
    chats[0].send("how is everyone".to_string()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("n2 and n3 missed both messages, repairing the link and joining");

    switch.broken.lock().unwrap().clear();
    for node in switch.nodes.lock().unwrap().values() {
        node.overlay_event(OverlayEvent::Join)?;
    }
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    chats[2].send("all caught up".to_string()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (name, chat) in names.iter().zip(&chats) {
        let stats = chat.stats().await?;
        info!(
            node = name,
            sent = stats.sent,
            delivered = stats.delivered,
            duplicates = stats.duplicates_suppressed,
            rounds = stats.anti_entropy_rounds,
            "final stats"
        );
    }

    Ok(())
}
