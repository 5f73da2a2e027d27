//! Keyed FIFO mutex
//!
//! Messages are queued per key. A caller that finds the key free takes the
//! lock together with the oldest queued message in one step; while it holds
//! the lock, other callers only enqueue. After releasing, the holder drains
//! again, so a message enqueued during handling is never left behind.
//! Locks held longer than the configured TTL are force-released by
//! [`KeyedMutex::sweep_stale`].

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::warn;

/// Result of trying to take the lock of a key
#[derive(Debug)]
pub enum Acquire<K, M> {
    /// Lock taken; handle the message, then [`KeyedMutex::release`] the token
    Acquired(M, LockToken<K>),
    /// Another holder is draining this key
    Busy,
    /// Nothing queued
    Empty,
}

/// Proof of holding a key's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken<K> {
    key: K,
    generation: u64,
}

impl<K> LockToken<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

#[derive(Debug)]
struct Slot<M> {
    queue: VecDeque<M>,
    held_since: Option<Instant>,
    generation: u64,
}

impl<M> Default for Slot<M> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            held_since: None,
            generation: 0,
        }
    }
}

/// FIFO queue plus lock per key
#[derive(Debug)]
pub struct KeyedMutex<K, M> {
    slots: Mutex<HashMap<K, Slot<M>>>,
    /// Shared across keys and never reset, so a token outlives its slot safely
    generations: AtomicU64,
}

impl<K, M> Default for KeyedMutex<K, M>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, M> KeyedMutex<K, M>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<M>>> {
        // The table stays consistent even if a holder panicked mid-update
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message behind everything already waiting on `key`
    pub fn enqueue(&self, key: K, message: M) {
        self.slots().entry(key).or_default().queue.push_back(message);
    }

    /// Take the lock and the oldest message of `key` atomically
    pub fn try_acquire(&self, key: &K) -> Acquire<K, M> {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return Acquire::Empty;
        };

        if slot.held_since.is_some() {
            return Acquire::Busy;
        }

        match slot.queue.pop_front() {
            Some(message) => {
                slot.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                slot.held_since = Some(Instant::now());
                Acquire::Acquired(
                    message,
                    LockToken {
                        key: key.clone(),
                        generation: slot.generation,
                    },
                )
            }
            None => {
                slots.remove(key);
                Acquire::Empty
            }
        }
    }

    /// Release a held lock; returns whether messages are still queued
    pub fn release(&self, token: LockToken<K>) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&token.key) else {
            return false;
        };

        if slot.generation == token.generation {
            slot.held_since = None;
        }

        let pending = !slot.queue.is_empty();
        if !pending && slot.held_since.is_none() {
            slots.remove(&token.key);
        }
        pending
    }

    /// Force-release locks held longer than `ttl`; returns keys with queued messages
    pub fn sweep_stale(&self, ttl: Duration) -> Vec<K> {
        let mut slots = self.slots();
        let mut wake = Vec::new();

        for (key, slot) in slots.iter_mut() {
            let stale = slot
                .held_since
                .is_some_and(|since| since.elapsed() >= ttl);
            if stale {
                slot.held_since = None;
                counter!("flow_stale_locks_total").increment(1);
                if !slot.queue.is_empty() {
                    wake.push(key.clone());
                }
            }
        }

        slots.retain(|_, s| s.held_since.is_some() || !s.queue.is_empty());

        if !wake.is_empty() {
            warn!(keys = wake.len(), "Force-released stale locks with queued messages");
        }
        wake
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.slots()
            .get(key)
            .is_some_and(|s| s.held_since.is_some())
    }

    /// Number of messages waiting on `key`
    pub fn queued(&self, key: &K) -> usize {
        self.slots().get(key).map_or(0, |s| s.queue.len())
    }
}
