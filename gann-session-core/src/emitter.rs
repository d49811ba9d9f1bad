//! Typed multi-listener fan-out with unsubscribe tokens (C2).
//!
//! Generic over an event key `K` (an event name) and a payload type `E`
//! shared by every key — mirroring a JS-style `EventEmitter` where the
//! event name selects the listener bucket but payload shape is left to the
//! caller's convention per key. [`crate::channel::SignalingChannel`] is the
//! sole consumer: it uses a small `&'static str` key space (`open`,
//! `close`, `error`, `signaling`, `session`, `control`, `heartbeat`, `raw`)
//! and a [`crate::channel::ChannelEvent`] payload enum.

use crate::sync_util::lock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque handle returned by [`Emitter::on`], used to remove the listener
/// again via [`Emitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A typed multi-listener event bus.
pub struct Emitter<K, E> {
    listeners: Mutex<HashMap<K, Vec<(ListenerId, Listener<E>)>>>,
    next_id: AtomicU64,
}

impl<K, E> Default for Emitter<K, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> Emitter<K, E>
where
    K: Eq + Hash + Clone,
{
    /// Construct an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `listener` for `key`, returning a token that can later be
    /// passed to [`Emitter::off`].
    pub fn on(&self, key: K, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = lock(&self.listeners);
        listeners
            .entry(key)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a previously registered listener. Drops the event's bucket
    /// entirely once its last listener leaves. Returns `true` if a
    /// listener was actually removed.
    pub fn off(&self, key: &K, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(bucket) = listeners.get_mut(key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(existing, _)| *existing != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            listeners.remove(key);
        }
        removed
    }

    /// Broadcast `event` to every listener currently registered for `key`.
    ///
    /// The listener set is snapshotted before iteration: a listener that
    /// unsubscribes itself during dispatch does not cause a successor to be
    /// skipped, and a listener registered during dispatch is not invoked
    /// for this call.
    pub fn emit(&self, key: &K, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let listeners = lock(&self.listeners);
            match listeners.get(key) {
                Some(bucket) => bucket.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            listener(event);
        }
    }

    /// Remove every listener for every key.
    pub fn clear(&self) {
        let mut listeners = lock(&self.listeners);
        listeners.clear();
    }

    /// Number of distinct keys with at least one listener. Exposed for
    /// tests asserting that closing a channel clears all subscriptions.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        lock(&self.listeners).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_in_registration_order() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in [1, 2, 3] {
            let order = Arc::clone(&order);
            emitter.on("x", move |v| order.lock().unwrap().push((tag, *v)));
        }
        emitter.emit(&"x", &42);
        assert_eq!(
            *order.lock().unwrap(),
            vec![(1, 42), (2, 42), (3, 42)]
        );
    }

    #[test]
    fn unsubscribe_during_dispatch_does_not_skip_successor() {
        let emitter: Arc<Emitter<&'static str, u32>> = Arc::new(Emitter::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let emitter_for_first = Arc::clone(&emitter);
        let first_id_cell: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let first_id_cell_inner = Arc::clone(&first_id_cell);
        let calls_first = Arc::clone(&calls);
        let first_id = emitter.on("x", move |_| {
            calls_first.lock().unwrap().push("first");
            if let Some(id) = *first_id_cell_inner.lock().unwrap() {
                emitter_for_first.off(&"x", id);
            }
        });
        *first_id_cell.lock().unwrap() = Some(first_id);

        let calls_second = Arc::clone(&calls);
        emitter.on("x", move |_| calls_second.lock().unwrap().push("second"));

        emitter.emit(&"x", &1);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);

        calls.lock().unwrap().clear();
        emitter.emit(&"x", &2);
        assert_eq!(*calls.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn listener_registered_during_dispatch_is_not_invoked_this_round() {
        let emitter: Arc<Emitter<&'static str, u32>> = Arc::new(Emitter::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let emitter_inner = Arc::clone(&emitter);
        let calls_inner = Arc::clone(&calls);
        emitter.on("x", move |_| {
            calls_inner.lock().unwrap().push("first");
            let calls_late = Arc::clone(&calls_inner);
            emitter_inner.on("x", move |_| calls_late.lock().unwrap().push("late"));
        });

        emitter.emit(&"x", &1);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn bucket_is_dropped_once_last_listener_leaves() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        let id = emitter.on("x", |_| {});
        assert_eq!(emitter.active_keys(), 1);
        emitter.off(&"x", id);
        assert_eq!(emitter.active_keys(), 0);
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_empty_state() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        assert_eq!(emitter.active_keys(), 0);
        let id = emitter.on("x", |_| {});
        emitter.off(&"x", id);
        assert_eq!(emitter.active_keys(), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        emitter.on("x", |_| {});
        emitter.on("y", |_| {});
        emitter.clear();
        assert_eq!(emitter.active_keys(), 0);
    }
}
