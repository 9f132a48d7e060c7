//! Buffering of received messages until they are causally ready.
//!
//! A message enters the buffer once, when the duplicate filter lets it through, and leaves it either by being
//! delivered or by turning out to be obsolete. Delivering one message can make others ready, so
//! [`DeliveryBuffer::review`] iterates to a fixed point.

use std::{collections::HashMap, fmt};

use tracing::trace;

use crate::{causality::CausalityOracle, error::DeliveryError, message::BroadcastMessage};

/// A broadcast message whose causal metadata comes from oracle `O`.
pub type Message<O, P> =
    BroadcastMessage<<O as CausalityOracle>::Id, <O as CausalityOracle>::Predicate, P>;

/// Outcome of one [`DeliveryBuffer::review`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Review {
    /// Messages handed to the application.
    pub delivered: usize,
    /// Messages removed because the oracle already covered them.
    pub dropped: usize,
    /// Scans of the buffer performed.
    pub passes: usize,
}

/// Received messages of one registration that are not yet causally ready.
pub struct DeliveryBuffer<O: CausalityOracle, P> {
    pending: HashMap<O::Id, Message<O, P>>,
}

impl<O: CausalityOracle, P> DeliveryBuffer<O, P> {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        DeliveryBuffer {
            pending: HashMap::new(),
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` if a message with this id is buffered.
    pub fn contains(&self, id: &O::Id) -> bool {
        self.pending.contains_key(id)
    }

    /// Duplicate filter: returns `false` if the message was already delivered or is already waiting here.
    ///
    /// A message that passes must be [inserted](DeliveryBuffer::insert) before it is relayed, so a second copy
    /// arriving in between is recognised as buffered.
    pub fn should_process(&self, oracle: &O, id: &O::Id) -> bool {
        !oracle.is_lower(id) && !self.pending.contains_key(id)
    }

    /// Buffers a message. Returns `false`, leaving the buffer unchanged, if its id is already present.
    pub fn insert(&mut self, message: Message<O, P>) -> bool {
        if self.pending.contains_key(&message.id) {
            return false;
        }
        self.pending.insert(message.id.clone(), message);
        true
    }

    /// Delivers every buffered message that is causally ready, until a full pass delivers nothing.
    ///
    /// For each delivered message the oracle is advanced with [`increment_from`](CausalityOracle::increment_from)
    /// before `deliver` is called, so a message is handed out at most once.
    pub fn review<F>(&mut self, oracle: &mut O, mut deliver: F) -> Result<Review, DeliveryError>
    where
        F: FnMut(Message<O, P>),
    {
        // every productive pass removes at least one message
        let bound = self.pending.len() + 1;
        let mut review = Review::default();

        loop {
            if review.passes == bound {
                return Err(DeliveryError::Stalled {
                    passes: review.passes,
                    buffered: self.pending.len(),
                });
            }
            review.passes += 1;

            let mut progress = false;
            let ids: Vec<O::Id> = self.pending.keys().cloned().collect();
            for id in ids {
                if oracle.is_lower(&id) {
                    self.pending.remove(&id);
                    review.dropped += 1;
                    trace!(?id, "dropped obsolete buffered message");
                    continue;
                }

                let ready = self
                    .pending
                    .get(&id)
                    .is_some_and(|message| oracle.is_ready(&message.ready));
                if !ready {
                    continue;
                }

                if let Some(message) = self.pending.remove(&id) {
                    oracle.increment_from(&id);
                    trace!(?id, "delivering causally ready message");
                    deliver(message);
                    review.delivered += 1;
                    progress = true;
                }
            }

            if !progress {
                return Ok(review);
            }
        }
    }
}

impl<O: CausalityOracle, P> fmt::Debug for DeliveryBuffer<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryBuffer")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<O: CausalityOracle, P> Default for DeliveryBuffer<O, P> {
    fn default() -> Self {
        Self::new()
    }
}
