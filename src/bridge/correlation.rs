//! Correlation Table
//!
//! Maps correlation ids to pending continuations and owns id allocation.
//! Ids are never handed out twice while pending; freed ids are reused
//! smallest-first so allocation is deterministic.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use super::envelope::CorrelationId;

/// Smallest-unused integer allocator.
///
/// Every id below `next` that is not in `free` is in use, so the smallest
/// unused id is either the first free one or `next`.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    first: u32,
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub fn starting_at(first: u32) -> Self {
        Self {
            first,
            next: first,
            free: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next = self.next.saturating_add(1);
        id
    }

    /// Return `id` to the pool. Releasing an id that is not allocated is a
    /// no-op and returns `false`.
    pub fn release(&mut self, id: u32) -> bool {
        if !self.is_allocated(id) {
            return false;
        }
        if id + 1 == self.next {
            self.next = id;
            // Shrink the watermark over trailing free ids.
            while let Some(&last) = self.free.last() {
                if last + 1 != self.next {
                    break;
                }
                self.free.pop_last();
                self.next = last;
            }
        } else {
            self.free.insert(id);
        }
        true
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        id >= self.first && id < self.next && !self.free.contains(&id)
    }
}

/// Whether a continuation stays registered after being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Persistent continuation: keep it for the next reply.
    Keep,
    /// One-shot: remove it and free the id.
    Release,
}

/// A continuation that can be completed with a reply.
pub trait Completion {
    type Value;
    type Error;

    fn complete(&mut self, outcome: Result<Self::Value, Self::Error>) -> Disposition;
}

struct Entry<C> {
    /// `None` while the continuation is checked out for invocation.
    continuation: Option<C>,
    persistent: bool,
    registered_at: Instant,
}

pub struct CorrelationTable<C> {
    ids: IdAllocator,
    entries: HashMap<CorrelationId, Entry<C>>,
}

impl<C> Default for CorrelationTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CorrelationTable<C> {
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::starting_at(1),
            entries: HashMap::new(),
        }
    }

    /// Reserve the smallest unused id.
    pub fn allocate(&mut self) -> CorrelationId {
        CorrelationId(self.ids.allocate())
    }

    /// Attach a continuation to an allocated id. Returns `false` if the id was
    /// not allocated or already carries a continuation.
    pub fn register(&mut self, id: CorrelationId, continuation: C, persistent: bool) -> bool {
        if !self.ids.is_allocated(id.0) || self.entries.contains_key(&id) {
            log::warn!("[Correlation] refusing to register unallocated or busy id {}", id);
            return false;
        }
        self.entries.insert(
            id,
            Entry {
                continuation: Some(continuation),
                persistent,
                registered_at: Instant::now(),
            },
        );
        true
    }

    /// Allocate and register in one step.
    pub fn insert(&mut self, continuation: C, persistent: bool) -> CorrelationId {
        let id = self.allocate();
        self.register(id, continuation, persistent);
        id
    }

    /// Take the continuation out for invocation. The id stays reserved until
    /// `checkin` or `release`.
    pub fn checkout(&mut self, id: CorrelationId) -> Option<C> {
        self.entries.get_mut(&id)?.continuation.take()
    }

    /// Hand a checked-out continuation back. `Keep` re-arms it, `Release`
    /// removes it. If the id was released in the meantime, or released and
    /// handed to a new call, the table is left alone and the continuation is
    /// returned for the caller to drop.
    pub fn checkin(&mut self, id: CorrelationId, continuation: C, disposition: Disposition) -> Option<C> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Some(continuation);
        };
        if entry.continuation.is_some() {
            return Some(continuation);
        }
        match disposition {
            Disposition::Keep => entry.continuation = Some(continuation),
            Disposition::Release => {
                self.entries.remove(&id);
                self.ids.release(id.0);
                return Some(continuation);
            }
        }
        None
    }

    /// Remove an entry and free its id. Returns the continuation unless it
    /// is currently checked out. Also frees ids that were allocated but never
    /// registered.
    pub fn release(&mut self, id: CorrelationId) -> Option<C> {
        let entry = self.entries.remove(&id);
        self.ids.release(id.0);
        entry.and_then(|e| e.continuation)
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove one-shot continuations registered at least `timeout` before
    /// `now`. Persistent ones never expire.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(CorrelationId, C)> {
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.persistent
                    && e.continuation.is_some()
                    && now.saturating_duration_since(e.registered_at) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(continuation) = self.release(id) {
                out.push((id, continuation));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

impl<C: Completion> CorrelationTable<C> {
    /// Invoke the success path. Unknown ids are a no-op, since duplicate
    /// replies are possible.
    pub fn resolve(&mut self, id: CorrelationId, value: C::Value) -> bool {
        let Some(mut continuation) = self.checkout(id) else {
            log::debug!("[Correlation] resolve for unknown id {} ignored", id);
            return false;
        };
        let disposition = continuation.complete(Ok(value));
        self.checkin(id, continuation, disposition);
        true
    }

    /// Invoke the failure path. The entry is always removed.
    pub fn reject(&mut self, id: CorrelationId, error: C::Error) -> bool {
        let Some(mut continuation) = self.checkout(id) else {
            log::debug!("[Correlation] reject for unknown id {} ignored", id);
            return false;
        };
        continuation.complete(Err(error));
        self.checkin(id, continuation, Disposition::Release);
        true
    }
}
