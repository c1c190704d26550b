// src/dag/ready_queue.rs

//! Priority queue of runnable items with aging.
//!
//! Effective priority is `priority + min(cap, floor(wait / interval) * step)`.
//! Higher effective priority pops first; within a tier, items pop in enqueue
//! order. Wait time is computed against the `now` the caller passes in, so
//! the queue itself never reads a clock.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::dag::item::ItemIdx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgingPolicy {
    pub interval: Duration,
    pub step: u32,
    pub cap: u32,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            step: 1,
            cap: 10,
        }
    }
}

impl AgingPolicy {
    /// No aging: pure priority + FIFO.
    pub fn disabled() -> Self {
        Self {
            interval: Duration::from_secs(30),
            step: 0,
            cap: 0,
        }
    }

    pub fn boost(&self, waited: Duration) -> u32 {
        if self.interval.is_zero() || self.step == 0 {
            return 0;
        }
        let periods = waited.as_nanos() / self.interval.as_nanos();
        let raw = periods.saturating_mul(u128::from(self.step));
        raw.min(u128::from(self.cap)) as u32
    }
}

#[derive(Debug, Clone)]
struct Entry {
    idx: ItemIdx,
    priority: u32,
    enqueued_at: Instant,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct ReadyQueue {
    entries: Vec<Entry>,
    members: HashSet<ItemIdx>,
    next_seq: u64,
    aging: AgingPolicy,
}

impl ReadyQueue {
    pub fn new(aging: AgingPolicy) -> Self {
        Self {
            entries: Vec::new(),
            members: HashSet::new(),
            next_seq: 0,
            aging,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, idx: ItemIdx) -> bool {
        self.members.contains(&idx)
    }

    /// Returns `false` if `idx` is already queued.
    pub fn push(&mut self, idx: ItemIdx, priority: u32, now: Instant) -> bool {
        if !self.members.insert(idx) {
            return false;
        }
        self.entries.push(Entry {
            idx,
            priority,
            enqueued_at: now,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    fn effective(&self, entry: &Entry, now: Instant) -> u64 {
        let waited = now.saturating_duration_since(entry.enqueued_at);
        u64::from(entry.priority) + u64::from(self.aging.boost(waited))
    }

    pub fn effective_priority(&self, idx: ItemIdx, now: Instant) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.idx == idx)
            .map(|e| self.effective(e, now))
    }

    fn best_position(&self, now: Instant) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                self.effective(a, now)
                    .cmp(&self.effective(b, now))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(pos, _)| pos)
    }

    pub fn pop(&mut self, now: Instant) -> Option<ItemIdx> {
        let pos = self.best_position(now)?;
        let entry = self.entries.swap_remove(pos);
        self.members.remove(&entry.idx);
        Some(entry.idx)
    }

    pub fn remove(&mut self, idx: ItemIdx) -> bool {
        if !self.members.remove(&idx) {
            return false;
        }
        self.entries.retain(|e| e.idx != idx);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.members.clear();
    }

    /// Remove everything, returning handles in the order they would pop.
    pub fn drain(&mut self, now: Instant) -> Vec<ItemIdx> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(idx) = self.pop(now) {
            out.push(idx);
        }
        out
    }

    /// Pop order at `now` without modifying the queue.
    pub fn peek_order(&self, now: Instant) -> Vec<ItemIdx> {
        self.clone().drain(now)
    }
}
