#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use causal_broadcast::{
    BroadcastConfig, Envelope, PeerId, PeerSampling, ProtocolId, ProtocolRegistration, ProtocolRegistry,
    VersionVector,
};
use rand::Rng;
use tracing_subscriber::EnvFilter;

pub type Chat = ProtocolRegistration<VersionVector, String>;

pub const CHAT: &str = "chat";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub from: PeerId,
    pub to: PeerId,
    pub envelope: Envelope,
}

/// Links shared by every node: one FIFO queue plus the set of links currently losing everything.
#[derive(Default)]
struct Wire {
    queue: Mutex<VecDeque<Packet>>,
    blocked: Mutex<HashSet<(PeerId, PeerId)>>,
    dropped: Mutex<usize>,
}

struct NodeOverlay {
    id: PeerId,
    neighbors: Mutex<Vec<PeerId>>,
    wire: Arc<Wire>,
}

impl PeerSampling for NodeOverlay {
    fn get_peers(&self, fanout: Option<usize>) -> Vec<PeerId> {
        let neighbors = self.neighbors.lock().unwrap();
        neighbors
            .iter()
            .take(fanout.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    fn send(&self, peer: &PeerId, envelope: Envelope, _retry: u32) {
        if self
            .wire
            .blocked
            .lock()
            .unwrap()
            .contains(&(self.id.clone(), peer.clone()))
        {
            *self.wire.dropped.lock().unwrap() += 1;
            return;
        }
        self.wire.queue.lock().unwrap().push_back(Packet {
            from: self.id.clone(),
            to: peer.clone(),
            envelope,
        });
    }
}

struct Node {
    registry: ProtocolRegistry,
    overlay: NodeOverlay,
}

/// A deterministic in-memory network of sync registries.
#[derive(Default)]
pub struct Network {
    nodes: BTreeMap<PeerId, Node>,
    wire: Arc<Wire>,
    pub routing_errors: Vec<String>,
}

impl Network {
    pub fn new() -> Self {
        init_tracing();
        Network::default()
    }

    /// Builds a line of nodes, each connected to the next.
    pub fn chain(names: &[&str]) -> Self {
        let mut network = Network::new();
        for name in names {
            network.add_node(name);
        }
        for pair in names.windows(2) {
            network.connect(pair[0], pair[1]);
        }
        network
    }

    pub fn add_node(&mut self, name: &str) {
        let id = PeerId::from(name);
        self.nodes.insert(
            id.clone(),
            Node {
                registry: ProtocolRegistry::new(),
                overlay: NodeOverlay {
                    id,
                    neighbors: Mutex::new(Vec::new()),
                    wire: self.wire.clone(),
                },
            },
        );
    }

    pub fn connect(&mut self, a: &str, b: &str) {
        self.node(a).overlay.neighbors.lock().unwrap().push(b.into());
        self.node(b).overlay.neighbors.lock().unwrap().push(a.into());
    }

    pub fn block(&mut self, from: &str, to: &str) {
        self.wire.blocked.lock().unwrap().insert((from.into(), to.into()));
    }

    pub fn unblock(&mut self, from: &str, to: &str) {
        self.wire.blocked.lock().unwrap().remove(&(from.into(), to.into()));
    }

    pub fn dropped(&self) -> usize {
        *self.wire.dropped.lock().unwrap()
    }

    pub fn in_flight(&self) -> usize {
        self.wire.queue.lock().unwrap().len()
    }

    /// Removes every queued packet without delivering it.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.wire.queue.lock().unwrap().drain(..).collect()
    }

    pub fn registry(&mut self, name: &str) -> &mut ProtocolRegistry {
        &mut self.node(name).registry
    }

    /// Registers the chat protocol on `name` with a version vector, collecting delivered payloads.
    pub fn register_chat(&mut self, name: &str) -> Arc<Mutex<Vec<String>>> {
        self.register_chat_with(name, &BroadcastConfig::default())
    }

    pub fn register_chat_with(&mut self, name: &str, config: &BroadcastConfig) -> Arc<Mutex<Vec<String>>> {
        let registration: Chat = ProtocolRegistration::new(CHAT, VersionVector::new(name), config);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        registration.on_deliver(move |payload: &String| sink.lock().unwrap().push(payload.clone()));
        self.registry(name).insert(registration).unwrap();
        delivered
    }

    /// Runs `f` against a registration of `name` with the node's overlay.
    pub fn with<R>(&mut self, name: &str, protocol_id: &str, f: impl FnOnce(&mut Chat, &dyn PeerSampling) -> R) -> R {
        let node = self.node(name);
        let registration = node
            .registry
            .get_mut::<VersionVector, String>(&ProtocolId::from(protocol_id))
            .expect("chat registration");
        f(registration, &node.overlay)
    }

    pub fn send(&mut self, name: &str, payload: &str) {
        self.with(name, CHAT, |chat, overlay| {
            chat.broadcast(payload.to_owned(), overlay).unwrap();
        });
    }

    pub fn anti_entropy_round(&mut self, name: &str) {
        let node = self.node(name);
        node.registry
            .anti_entropy_round(&ProtocolId::from(CHAT), &node.overlay)
            .unwrap();
    }

    /// Delivers one packet, the oldest queued. Returns `false` if nothing was queued.
    pub fn step(&mut self) -> bool {
        let packet = self.wire.queue.lock().unwrap().pop_front();
        match packet {
            Some(packet) => {
                self.deliver(packet);
                true
            }
            None => false,
        }
    }

    /// Delivers packets in FIFO order until the network is quiet. Returns how many were delivered.
    pub fn run(&mut self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    /// Delivers packets in a random order until the network is quiet.
    pub fn run_shuffled(&mut self, rng: &mut impl Rng) -> usize {
        let mut delivered = 0;
        loop {
            let packet = {
                let mut queue = self.wire.queue.lock().unwrap();
                if queue.is_empty() {
                    break;
                }
                let index = rng.gen_range(0..queue.len());
                queue.remove(index)
            };
            if let Some(packet) = packet {
                self.deliver(packet);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn deliver(&mut self, packet: Packet) {
        let Some(node) = self.nodes.get_mut(&packet.to) else {
            return;
        };
        if let Err(err) = node
            .registry
            .dispatch(&packet.from, &packet.envelope, &node.overlay)
        {
            self.routing_errors.push(err.to_string());
        }
    }

    fn node(&mut self, name: &str) -> &mut Node {
        self.nodes
            .get_mut(name)
            .unwrap_or_else(|| panic!("unknown node {name}"))
    }
}

pub fn delivered(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}
