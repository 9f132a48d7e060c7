//! Subscriber sets for the events a registration emits.
//!
//! A handler is registered with `subscribe` and receives a [`SubscriptionId`] that removes it again. Handlers run
//! on the broadcast event loop, in subscription order. The shared set is unlocked while handlers run, so a handler
//! may subscribe or unsubscribe on its own registration, including removing itself.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

type Handler<T> = Box<dyn FnMut(&T) + Send>;

// ids are unique across subscriber sets, so a handle can look a token up in each of its sets
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Token returned by a subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Handlers interested in events of type `T`.
pub struct Subscribers<T> {
    handlers: BTreeMap<SubscriptionId, Handler<T>>,
    // ids of the handlers lent out to a running emit
    lent: Option<BTreeSet<SubscriptionId>>,
}

impl<T> Subscribers<T> {
    /// Creates an empty subscriber set.
    pub fn new() -> Self {
        Subscribers {
            handlers: BTreeMap::new(),
            lent: None,
        }
    }

    /// Adds a handler.
    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&T) + Send + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(id, Box::new(handler));
        id
    }

    /// Removes a handler. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.handlers.remove(&id).is_some() || self.lent.as_mut().is_some_and(|lent| lent.remove(&id))
    }

    /// Calls every handler with `event`.
    pub fn emit(&mut self, event: &T) {
        for handler in self.handlers.values_mut() {
            handler(event);
        }
    }

    /// Number of subscribed handlers.
    pub fn len(&self) -> usize {
        self.handlers.len() + self.lent.as_ref().map_or(0, BTreeSet::len)
    }

    /// Returns `true` if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_lent(&self, id: &SubscriptionId) -> bool {
        self.lent.as_ref().is_some_and(|lent| lent.contains(id))
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

/// Subscriber set shared between a registration and its handle.
pub(crate) struct SharedSubscribers<T>(Arc<Mutex<Subscribers<T>>>);

impl<T> SharedSubscribers<T> {
    pub(crate) fn new() -> Self {
        SharedSubscribers(Arc::new(Mutex::new(Subscribers::new())))
    }

    /// A panicking handler must not take the registration down with it.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Subscribers<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls every handler with `event` without holding the lock, so handlers can reach this set again.
    ///
    /// Handlers added during the emit first see the next event. A handler removed during the emit is not called
    /// again, even later in the same emit.
    pub(crate) fn emit(&self, event: &T) {
        let mut lent = {
            let mut subscribers = self.lock();
            let handlers = std::mem::take(&mut subscribers.handlers);
            subscribers.lent = Some(handlers.keys().copied().collect());
            handlers
        };

        for (id, handler) in lent.iter_mut() {
            if self.lock().is_lent(id) {
                handler(event);
            }
        }

        let mut subscribers = self.lock();
        let still_subscribed = subscribers.lent.take().unwrap_or_default();
        lent.retain(|id, _| still_subscribed.contains(id));
        subscribers.handlers.append(&mut lent);
    }
}

impl<T> Clone for SharedSubscribers<T> {
    fn clone(&self) -> Self {
        SharedSubscribers(Arc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_every_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subscribers = Subscribers::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            subscribers.subscribe(move |value: &u32| seen.lock().unwrap().push((tag, *value)));
        }

        subscribers.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn unsubscribed_handler_stops_receiving() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut subscribers = Subscribers::new();
        let id = {
            let count = count.clone();
            subscribers.subscribe(move |_: &()| {
                count.fetch_add(1, Ordering::Relaxed);
            })
        };

        subscribers.emit(&());
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.emit(&());

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn handler_can_unsubscribe_itself() {
        let shared = SharedSubscribers::<u8>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));
        let id = {
            let (shared, count, own_id) = (shared.clone(), count.clone(), own_id.clone());
            shared.clone().lock().subscribe(move |_| {
                count.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = *own_id.lock().unwrap() {
                    assert!(shared.lock().unsubscribe(id));
                }
            })
        };
        *own_id.lock().unwrap() = Some(id);

        shared.emit(&1);
        shared.emit(&2);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(shared.lock().is_empty());
    }

    #[test]
    fn subscriptions_made_during_emit_start_with_the_next_event() {
        let shared = SharedSubscribers::<u8>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let (shared, seen) = (shared.clone(), seen.clone());
            shared.clone().lock().subscribe(move |_| {
                let seen = seen.clone();
                shared.lock().subscribe(move |late| seen.lock().unwrap().push((*late, "late")));
            });
        }

        shared.emit(&1);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(shared.lock().len(), 2);

        shared.emit(&2);
        assert_eq!(*seen.lock().unwrap(), vec![(2, "late")]);
    }

    #[test]
    fn handler_removed_by_an_earlier_handler_is_skipped() {
        let shared = SharedSubscribers::<u8>::new();
        let victim_calls = Arc::new(AtomicUsize::new(0));
        let victim = Arc::new(Mutex::new(None));
        {
            let (shared, victim) = (shared.clone(), victim.clone());
            shared.clone().lock().subscribe(move |_| {
                if let Some(id) = victim.lock().unwrap().take() {
                    shared.lock().unsubscribe(id);
                }
            });
        }
        let id = {
            let victim_calls = victim_calls.clone();
            shared.lock().subscribe(move |_| {
                victim_calls.fetch_add(1, Ordering::Relaxed);
            })
        };
        *victim.lock().unwrap() = Some(id);

        shared.emit(&1);
        assert_eq!(victim_calls.load(Ordering::Relaxed), 0);
        assert_eq!(shared.lock().len(), 1);
    }

    #[test]
    fn shared_set_is_visible_through_clones() {
        let shared = SharedSubscribers::<u8>::new();
        let other = shared.clone();
        shared.lock().subscribe(|_| {});

        assert_eq!(other.lock().len(), 1);
    }
}
