//! Causality tracking consumed by the broadcast core.
//!
//! The core never looks inside a causality structure. It only asks the questions of [`CausalityOracle`]: has this
//! identifier been delivered, is this predicate satisfied, what does the next local message depend on. Each
//! registration owns one oracle exclusively.
//!
//! [`VersionVector`] is a ready-made oracle: one counter per origin plus the set of identifiers below that counter
//! which have not been observed yet. Exceptions let it record out of order deliveries (anti-entropy may hand over a
//! later message before an earlier one) without claiming the gap was seen.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::Hash,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Tracks which causal identifiers a registration has delivered.
///
/// Implementations must be monotonic: once [`is_lower`](CausalityOracle::is_lower) returns `true` for an identifier it
/// returns `true` forever. [`merge`](CausalityOracle::merge) must be commutative and idempotent. A message must never
/// be ready on itself, otherwise the delivery scheduler cannot make progress.
pub trait CausalityOracle: Send + 'static {
    /// Causal identifier minted for every broadcast message.
    type Id: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + 'static;
    /// Dependency descriptor a message carries.
    type Predicate: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + 'static;
    /// Immutable copy of the causal state, exchanged during anti-entropy.
    type Snapshot: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + 'static;

    /// Mints the identifier of a new local message and records it as delivered.
    fn increment(&mut self) -> Self::Id;

    /// Records a remote message as delivered.
    fn increment_from(&mut self, id: &Self::Id);

    /// Returns `true` if the identifier was already delivered.
    fn is_lower(&self, id: &Self::Id) -> bool;

    /// Returns `true` if everything the predicate depends on was delivered.
    fn is_ready(&self, predicate: &Self::Predicate) -> bool;

    /// Folds another node's causal state into this one.
    fn merge(&mut self, snapshot: &Self::Snapshot);

    /// Returns an immutable copy of the current causal state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Returns the predicate the next local message must carry.
    fn dependencies(&self) -> Self::Predicate;

    /// Returns `true` if `snapshot` already covers `id`.
    fn has_observed(snapshot: &Self::Snapshot, id: &Self::Id) -> bool;
}

/// Identifier of a message: the origin that sent it and the origin's counter at that moment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    /// Origin that minted the identifier.
    pub origin: String,
    /// Position of the message in the origin's sequence, starting at 1.
    pub counter: u64,
}

impl Dot {
    /// Creates a dot.
    pub fn new(origin: impl Into<String>, counter: u64) -> Self {
        Dot {
            origin: origin.into(),
            counter,
        }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.counter)
    }
}

/// Per origin, the length of the prefix that must be delivered first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies(BTreeMap<String, u64>);

impl Dependencies {
    /// Creates an empty predicate, ready everywhere.
    pub fn new() -> Self {
        Dependencies(BTreeMap::new())
    }

    /// Requires the first `counter` messages of `origin`.
    pub fn require(mut self, origin: impl Into<String>, counter: u64) -> Self {
        self.0.insert(origin.into(), counter);
        self
    }

    /// Iterates over the required prefixes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(origin, counter)| (origin.as_str(), *counter))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    counter: u64,
    exceptions: BTreeSet<u64>,
}

impl Entry {
    fn contains(&self, counter: u64) -> bool {
        counter != 0 && counter <= self.counter && !self.exceptions.contains(&counter)
    }

    /// Highest counter such that every message up to it was observed.
    fn contiguous(&self) -> u64 {
        self.exceptions
            .first()
            .map(|first| first - 1)
            .unwrap_or(self.counter)
    }

    fn add(&mut self, counter: u64) {
        if counter == 0 {
            return;
        }
        if counter > self.counter {
            self.exceptions.extend(self.counter + 1..counter);
            self.counter = counter;
        } else {
            self.exceptions.remove(&counter);
        }
    }

    fn merge(&mut self, other: &Entry) {
        let exceptions = self
            .exceptions
            .union(&other.exceptions)
            .copied()
            .filter(|c| !self.contains(*c) && !other.contains(*c))
            .collect();
        self.counter = self.counter.max(other.counter);
        self.exceptions = exceptions;
    }
}

/// A version vector with exceptions, usable as a [`CausalityOracle`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    local: String,
    entries: BTreeMap<String, Entry>,
}

impl VersionVector {
    /// Creates an empty vector for the origin `local`.
    pub fn new(local: impl Into<String>) -> Self {
        VersionVector {
            local: local.into(),
            entries: BTreeMap::new(),
        }
    }

    /// The origin this vector mints identifiers for.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Number of messages of `origin` observed without gaps.
    pub fn contiguous(&self, origin: &str) -> u64 {
        self.entries.get(origin).map(Entry::contiguous).unwrap_or(0)
    }

    /// Returns `true` if the message `counter` of `origin` was observed.
    ///
    /// Counters start at 1. Counter 0 names no message and always counts as observed, so a message carrying it
    /// is filtered as a duplicate instead of being delivered on every copy.
    pub fn contains(&self, origin: &str, counter: u64) -> bool {
        counter == 0
            || self
                .entries
                .get(origin)
                .is_some_and(|entry| entry.contains(counter))
    }
}

impl CausalityOracle for VersionVector {
    type Id = Dot;
    type Predicate = Dependencies;
    type Snapshot = VersionVector;

    fn increment(&mut self) -> Dot {
        let entry = self.entries.entry(self.local.clone()).or_default();
        let counter = entry.counter + 1;
        entry.add(counter);
        Dot::new(self.local.clone(), counter)
    }

    fn increment_from(&mut self, id: &Dot) {
        self.entries
            .entry(id.origin.clone())
            .or_default()
            .add(id.counter);
    }

    fn is_lower(&self, id: &Dot) -> bool {
        self.contains(&id.origin, id.counter)
    }

    fn is_ready(&self, predicate: &Dependencies) -> bool {
        predicate
            .iter()
            .all(|(origin, counter)| self.contiguous(origin) >= counter)
    }

    fn merge(&mut self, snapshot: &VersionVector) {
        for (origin, other) in &snapshot.entries {
            self.entries.entry(origin.clone()).or_default().merge(other);
        }
    }

    fn snapshot(&self) -> VersionVector {
        self.clone()
    }

    fn dependencies(&self) -> Dependencies {
        Dependencies(
            self.entries
                .iter()
                .map(|(origin, entry)| (origin.clone(), entry.contiguous()))
                .filter(|(_, counter)| *counter > 0)
                .collect(),
        )
    }

    fn has_observed(snapshot: &VersionVector, id: &Dot) -> bool {
        snapshot.is_lower(id)
    }
}
