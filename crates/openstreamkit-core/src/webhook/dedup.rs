//! Bounded, time-windowed record of recently seen event ids.
//!
//! An id is remembered until it is older than the window or until capacity
//! forces out the oldest entry, whichever comes first. Memory use is capped by
//! `capacity` regardless of delivery rate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::EventId;

/// Default retention window for seen ids.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(600);

/// Default maximum number of ids retained.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

struct DedupState {
    seen: HashMap<EventId, Instant>,
    order: VecDeque<(EventId, Instant)>,
}

impl DedupState {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some((_, inserted_at)) = self.order.front() {
            if now.saturating_duration_since(*inserted_at) < window {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.seen.remove(&id);
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((id, _)) = self.order.pop_front() {
            self.seen.remove(&id);
        }
    }
}

/// Concurrent insert-if-absent set with age and count eviction.
pub struct DedupCache {
    state: Mutex<DedupState>,
    window: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(DedupState {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            window,
            capacity: capacity.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `id` if it has not been seen inside the window.
    ///
    /// Returns `true` when the id is new (and is now recorded), `false` when it
    /// is a duplicate. The check and the insert happen under one lock.
    pub fn check_and_insert(&self, id: &EventId) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    pub fn check_and_insert_at(&self, id: &EventId, now: Instant) -> bool {
        // The map is always consistent between operations, so a poisoned lock
        // is still safe to use.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.evict_expired(now, self.window);

        if state.seen.contains_key(id) {
            return false;
        }

        while state.order.len() >= self.capacity {
            state.evict_oldest();
        }

        state.seen.insert(id.clone(), now);
        state.order.push_back((id.clone(), now));
        true
    }

    /// Whether `id` is currently remembered. Does not record anything.
    pub fn contains(&self, id: &EventId) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.seen.get(id) {
            Some(inserted_at) => inserted_at.elapsed() < self.window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW, DEFAULT_DEDUP_CAPACITY)
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("window", &self.window)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;
