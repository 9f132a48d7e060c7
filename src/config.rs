//! Configuration shared by every registration of a broadcast instance.

use std::time::Duration;

/// Default interval between anti-entropy rounds in seconds
pub const DEFAULT_DELTA_SECS: u64 = 60;

/// Default grace period after joining the overlay before the first anti-entropy round, in seconds
pub const DEFAULT_JOIN_GRACE_SECS: u64 = 5;

/// Default transport retry budget forwarded with every send
pub const DEFAULT_RETRY: u32 = 0;

/// Which neighbors receive an anti-entropy request each round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AntiEntropyScope {
    /// One neighbor chosen uniformly at random.
    #[default]
    RandomNeighbor,
    /// Every neighbor returned by the overlay (bounded by the fanout).
    AllNeighbors,
}

/// Configuration shared by every registration of a broadcast instance
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Maximum number of neighbors a message is pushed to, `None` meaning all of them
    pub fanout: Option<usize>,
    /// Retry budget forwarded to the overlay's unicast primitive
    pub retry: u32,
    /// Interval between anti-entropy rounds
    pub delta: Duration,
    /// Delay between the overlay's join signal and the first anti-entropy round
    pub join_grace: Duration,
    /// Which neighbors are asked for their causal state each round
    pub anti_entropy_scope: AntiEntropyScope,
    /// Maximum number of delivered messages kept to answer anti-entropy requests, `None` meaning unbounded
    pub history_limit: Option<usize>,
}

impl BroadcastConfig {
    /// Bounds dissemination to `fanout` neighbors chosen at random.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Sets the retry budget forwarded to the overlay.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the anti-entropy interval.
    pub fn with_delta(mut self, delta: Duration) -> Self {
        self.delta = delta;
        self
    }

    /// Sets the grace period between joining and the first anti-entropy round.
    pub fn with_join_grace(mut self, join_grace: Duration) -> Self {
        self.join_grace = join_grace;
        self
    }

    /// Sets which neighbors receive anti-entropy requests.
    pub fn with_anti_entropy_scope(mut self, scope: AntiEntropyScope) -> Self {
        self.anti_entropy_scope = scope;
        self
    }

    /// Caps the delivered history used to answer anti-entropy requests.
    ///
    /// Messages evicted from the history can no longer be streamed by this node. A requester that merges this node's
    /// causal state afterwards treats them as observed, so a limit trades repair completeness for memory.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            fanout: None,
            retry: DEFAULT_RETRY,
            delta: Duration::from_secs(DEFAULT_DELTA_SECS),
            join_grace: Duration::from_secs(DEFAULT_JOIN_GRACE_SECS),
            anti_entropy_scope: AntiEntropyScope::default(),
            history_limit: None,
        }
    }
}
