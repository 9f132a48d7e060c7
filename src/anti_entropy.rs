//! Anti-entropy reconciliation between neighbors.
//!
//! Gossip is lossy. Every `delta`, a registration sends its causal state to a neighbor, and the neighbor answers with
//! the delivered messages that state does not cover. Answers can be larger than what the overlay transport accepts
//! in one message, so they are streamed as [`AntiEntropyChunk`]s and reassembled here.
//!
//! # Reassembly
//!
//! At most one response per neighbor is assembled at a time. A chunk from a different stream replaces the partial
//! assembly, so a lost or interleaved earlier response never blocks a later one. Once the number of collected
//! elements reaches the announced total, the response is complete and handed back to the registration.

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    time::Duration,
};

use tokio::{
    sync::watch,
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{message::AntiEntropyChunk, overlay::PeerId};

/// Diagnostic event emitted when a neighbor asks for anti-entropy.
#[derive(Clone, Debug)]
pub struct AntiEntropyObserved<S> {
    /// Neighbor that sent the request.
    pub peer: PeerId,
    /// Causal state the neighbor sent.
    pub remote: S,
    /// Local causal state when the request was handled.
    pub local: S,
}

/// Builds the chunk stream answering one request: a header carrying the local causal state, then one chunk per
/// missing element.
pub fn response_chunks<S, M>(stream_id: u64, causality: S, missing: Vec<M>) -> Vec<AntiEntropyChunk<S, M>> {
    let total = missing.len();
    let mut chunks = Vec::with_capacity(total + 1);
    chunks.push(AntiEntropyChunk::header(stream_id, total, causality));
    chunks.extend(
        missing
            .into_iter()
            .map(|element| AntiEntropyChunk::element(stream_id, total, element)),
    );
    chunks
}

/// Delivered messages kept to answer anti-entropy requests, in delivery order.
#[derive(Debug)]
pub struct History<M> {
    entries: VecDeque<M>,
    limit: Option<usize>,
}

impl<M> History<M> {
    /// Creates a history keeping at most `limit` messages, or every message when `limit` is `None`.
    pub fn new(limit: Option<usize>) -> Self {
        History {
            entries: VecDeque::new(),
            limit,
        }
    }

    /// Appends a delivered message, evicting the oldest ones past the limit.
    pub fn push(&mut self, message: M) {
        self.entries.push_back(message);
        if let Some(limit) = self.limit {
            while self.entries.len() > limit {
                self.entries.pop_front();
            }
        }
    }

    /// Iterates over the retained messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.entries.iter()
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Partially received response of one stream.
#[derive(Debug)]
pub struct ResponseAssembly<S, M> {
    stream_id: u64,
    expected: usize,
    causality: Option<S>,
    elements: Vec<M>,
}

impl<S, M> ResponseAssembly<S, M> {
    fn new(stream_id: u64, expected: usize) -> Self {
        ResponseAssembly {
            stream_id,
            expected,
            causality: None,
            elements: Vec::with_capacity(expected),
        }
    }

    fn is_complete(&self) -> bool {
        self.elements.len() >= self.expected
    }
}

/// A fully reassembled response.
#[derive(Debug)]
pub struct CompletedResponse<S, M> {
    /// Stream the response was sent on.
    pub stream_id: u64,
    /// Responder's causal state, if its header chunk arrived.
    pub causality: Option<S>,
    /// Missing elements, in the order the responder sent them.
    pub elements: Vec<M>,
}

/// What a chunk did to the reassembly state.
#[derive(Debug)]
pub enum ChunkOutcome<S, M> {
    /// More chunks are expected.
    Pending,
    /// The chunk completed its stream.
    Complete(CompletedResponse<S, M>),
    /// The chunk belongs to a stream that already completed, e.g. a reordered header.
    Late {
        /// Causal state carried by the chunk.
        causality: Option<S>,
        /// Element carried by the chunk.
        element: Option<M>,
    },
}

/// Reassembly state of one registration, one in-flight response per neighbor.
#[derive(Debug)]
pub struct Assemblies<S, M> {
    in_flight: HashMap<PeerId, ResponseAssembly<S, M>>,
    completed: HashMap<PeerId, u64>,
}

impl<S, M> Assemblies<S, M> {
    /// Creates an empty reassembly state.
    pub fn new() -> Self {
        Assemblies {
            in_flight: HashMap::new(),
            completed: HashMap::new(),
        }
    }

    /// Feeds one chunk received from `peer`.
    pub fn accept(&mut self, peer: &PeerId, chunk: AntiEntropyChunk<S, M>) -> ChunkOutcome<S, M> {
        if self.completed.get(peer) == Some(&chunk.stream_id) {
            return ChunkOutcome::Late {
                causality: chunk.causality,
                element: chunk.element,
            };
        }

        let assembly = match self.in_flight.entry(peer.clone()) {
            Entry::Occupied(entry) if entry.get().stream_id == chunk.stream_id => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                debug!(
                    %peer,
                    stale_stream_id = entry.get().stream_id,
                    stream_id = chunk.stream_id,
                    collected = entry.get().elements.len(),
                    "discarding partial anti-entropy response"
                );
                entry.insert(ResponseAssembly::new(chunk.stream_id, chunk.total));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(ResponseAssembly::new(chunk.stream_id, chunk.total)),
        };

        if let Some(causality) = chunk.causality {
            assembly.causality = Some(causality);
        }
        if let Some(element) = chunk.element {
            assembly.elements.push(element);
        }
        if !assembly.is_complete() {
            return ChunkOutcome::Pending;
        }

        match self.in_flight.remove(peer) {
            Some(done) => {
                self.completed.insert(peer.clone(), done.stream_id);
                ChunkOutcome::Complete(CompletedResponse {
                    stream_id: done.stream_id,
                    causality: done.causality,
                    elements: done.elements,
                })
            }
            None => ChunkOutcome::Pending,
        }
    }

    /// Drops any state kept for `peer`, e.g. when its connection closed.
    pub fn forget(&mut self, peer: &PeerId) {
        self.in_flight.remove(peer);
        self.completed.remove(peer);
    }

    /// Number of responses currently being assembled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<S, M> Default for Assemblies<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the round timer of one registration.
///
/// The timer waits until `joined` turns `true`, waits `grace` more so the overlay can finish its connection
/// handshake, then calls `tick` every `delta`. It stops when `tick` returns `false`, when the join channel closes
/// before joining, or when the returned handle is aborted.
pub fn schedule_rounds<F>(
    mut joined: watch::Receiver<bool>,
    grace: Duration,
    delta: Duration,
    mut tick: F,
) -> AbortHandle
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let has_joined = joined.wait_for(|joined| *joined).await.is_ok();
        if !has_joined {
            return;
        }

        // interval panics on a zero period
        let delta = delta.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + grace, delta);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !tick() {
                return;
            }
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    #[test]
    fn response_with_nothing_missing_is_a_single_header() {
        let chunks = response_chunks::<_, u8>(3, "state", Vec::new());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total, 0);
        assert_eq!(chunks[0].causality, Some("state"));
    }

    #[test]
    fn response_streams_one_chunk_per_element() {
        let chunks = response_chunks(3, "state", vec![10u8, 11, 12]);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.stream_id == 3 && chunk.total == 3));
        let elements: Vec<_> = chunks.iter().filter_map(|chunk| chunk.element).collect();
        assert_eq!(elements, vec![10, 11, 12]);
    }

    #[test]
    fn assembly_completes_when_count_reached() {
        let mut assemblies = Assemblies::new();
        let mut chunks = response_chunks(1, "state", vec![1u8, 2]).into_iter();

        assert!(matches!(assemblies.accept(&peer("a"), chunks.next().unwrap()), ChunkOutcome::Pending));
        assert!(matches!(assemblies.accept(&peer("a"), chunks.next().unwrap()), ChunkOutcome::Pending));
        match assemblies.accept(&peer("a"), chunks.next().unwrap()) {
            ChunkOutcome::Complete(done) => {
                assert_eq!(done.stream_id, 1);
                assert_eq!(done.causality, Some("state"));
                assert_eq!(done.elements, vec![1, 2]);
            }
            other => panic!("expected complete response, got {other:?}"),
        }
        assert_eq!(assemblies.in_flight(), 0);
    }

    #[test]
    fn empty_response_completes_immediately() {
        let mut assemblies = Assemblies::<_, u8>::new();
        let header = response_chunks(5, "state", Vec::new()).remove(0);

        assert!(matches!(assemblies.accept(&peer("a"), header), ChunkOutcome::Complete(_)));
    }

    #[test]
    fn newer_stream_replaces_partial_assembly() {
        let mut assemblies = Assemblies::new();
        let old = response_chunks(1, "old", vec![1u8, 2, 3]);
        let new = response_chunks(2, "new", vec![9u8]);

        assemblies.accept(&peer("a"), old[0].clone());
        assemblies.accept(&peer("a"), old[1].clone());
        assert!(matches!(assemblies.accept(&peer("a"), new[0].clone()), ChunkOutcome::Pending));
        match assemblies.accept(&peer("a"), new[1].clone()) {
            ChunkOutcome::Complete(done) => {
                assert_eq!(done.stream_id, 2);
                assert_eq!(done.causality, Some("new"));
                assert_eq!(done.elements, vec![9]);
            }
            other => panic!("expected complete response, got {other:?}"),
        }
    }

    #[test]
    fn streams_from_different_peers_do_not_interfere() {
        let mut assemblies = Assemblies::new();
        let from_a = response_chunks(1, "a", vec![1u8]);
        let from_b = response_chunks(2, "b", vec![2u8]);

        assemblies.accept(&peer("a"), from_a[0].clone());
        assemblies.accept(&peer("b"), from_b[0].clone());
        assert_eq!(assemblies.in_flight(), 2);
        assert!(matches!(assemblies.accept(&peer("a"), from_a[1].clone()), ChunkOutcome::Complete(_)));
        assert!(matches!(assemblies.accept(&peer("b"), from_b[1].clone()), ChunkOutcome::Complete(_)));
    }

    #[test]
    fn reordered_header_after_completion_is_late() {
        let mut assemblies = Assemblies::new();
        let chunks = response_chunks(4, "state", vec![7u8]);

        assert!(matches!(assemblies.accept(&peer("a"), chunks[1].clone()), ChunkOutcome::Complete(_)));
        match assemblies.accept(&peer("a"), chunks[0].clone()) {
            ChunkOutcome::Late { causality, element } => {
                assert_eq!(causality, Some("state"));
                assert!(element.is_none());
            }
            other => panic!("expected late chunk, got {other:?}"),
        }
    }

    #[test]
    fn forget_drops_partial_state() {
        let mut assemblies = Assemblies::new();
        assemblies.accept(&peer("a"), response_chunks(1, "s", vec![1u8]).remove(0));
        assert_eq!(assemblies.in_flight(), 1);

        assemblies.forget(&peer("a"));
        assert_eq!(assemblies.in_flight(), 0);
    }

    #[test]
    fn history_evicts_oldest_past_limit() {
        let mut history = History::new(Some(2));
        for value in 1..=4 {
            history.push(value);
        }
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![3, 4]);

        let mut unbounded = History::new(None);
        for value in 1..=4 {
            unbounded.push(value);
        }
        assert_eq!(unbounded.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rounds_start_after_join_and_grace() {
        let (joined_tx, joined_rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = schedule_rounds(joined_rx, Duration::from_secs(5), Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        joined_tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        handle.abort();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rounds_stop_when_tick_declines() {
        let (_joined_tx, joined_rx) = watch::channel(true);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        schedule_rounds(joined_rx, Duration::ZERO, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
