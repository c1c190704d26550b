// src/persist/store.rs

//! Session store abstraction and the in-memory implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dag::{GraphStore, Item, ItemId};
use crate::errors::{ExecutionError, PlanError, Result};
use crate::persist::record::TransitionRecord;

/// Current on-disk snapshot format.
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Item states as of the last snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    pub session_version: u64,
    pub last_seq: u64,
    pub items: Vec<Item>,
}

/// What `TransitionStore::load` hands back: snapshot plus replayed log tail.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_version: u64,
    pub last_seq: u64,
    pub items: Vec<Item>,
    /// Log records applied on top of the snapshot.
    pub replayed: usize,
    /// Trailing log lines dropped because they were torn or corrupt.
    pub discarded_tail: usize,
}

/// Durable record of item transitions.
///
/// `commit` is the single write path: it compares the persisted version of
/// the record's item with `expected_version` and, on a match, records the
/// transition and bumps the persisted version.
pub trait TransitionStore: Send + fmt::Debug {
    /// Write a baseline for a fresh session.
    fn initialize(&mut self, graph: &GraphStore) -> Result<()>;

    /// Returns the item's new persisted version.
    fn commit(&mut self, record: TransitionRecord, expected_version: u64) -> Result<u64>;

    /// `None` when no session exists yet.
    fn load(&mut self) -> Result<Option<SessionState>>;

    /// Compact everything committed so far into a snapshot.
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Persisted per-item status/version view shared by the store implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct Ledger {
    items: BTreeMap<ItemId, Item>,
    last_seq: u64,
    session_version: u64,
}

impl Ledger {
    pub(crate) fn from_graph(graph: &GraphStore) -> Self {
        Self {
            items: graph
                .snapshot_items()
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect(),
            last_seq: 0,
            session_version: 0,
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            items: snapshot
                .items
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect(),
            last_seq: snapshot.last_seq,
            session_version: snapshot.session_version,
        }
    }

    /// Version check plus in-memory apply. Assigns `seq` and `version`.
    pub(crate) fn apply(&mut self, record: &mut TransitionRecord, expected: u64) -> Result<u64> {
        let item = self
            .items
            .get_mut(&record.item)
            .ok_or_else(|| PlanError::NotFound(record.item.to_string()))?;
        if item.version != expected {
            return Err(PlanError::VersionConflict {
                item: record.item.clone(),
                expected,
                actual: item.version,
            });
        }

        item.status = record.to;
        item.version += 1;
        self.last_seq += 1;
        self.session_version += 1;

        record.seq = self.last_seq;
        record.version = item.version;
        Ok(item.version)
    }

    /// Apply a record read back from the log. Records for unknown items are
    /// skipped.
    pub(crate) fn replay(&mut self, record: &TransitionRecord) -> bool {
        let Some(item) = self.items.get_mut(&record.item) else {
            warn!(item = %record.item, seq = record.seq, "log record for unknown item; skipping");
            return false;
        };
        if item.status != record.from {
            debug!(
                item = %record.item,
                seq = record.seq,
                expected = %record.from,
                found = %item.status,
                "log record source status differs from snapshot; log wins"
            );
        }
        item.status = record.to;
        item.version = record.version;
        self.last_seq = self.last_seq.max(record.seq);
        self.session_version += 1;
        true
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            format: SNAPSHOT_FORMAT,
            session_version: self.session_version,
            last_seq: self.last_seq,
            items: self.items.values().cloned().collect(),
        }
    }

    pub(crate) fn state(&self, replayed: usize, discarded_tail: usize) -> SessionState {
        SessionState {
            session_version: self.session_version,
            last_seq: self.last_seq,
            items: self.items.values().cloned().collect(),
            replayed,
            discarded_tail,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    ledger: Option<Ledger>,
    log: Vec<TransitionRecord>,
    fail_saves: bool,
}

/// Store that keeps the session in memory only.
///
/// Clones share the same session, so a test can keep a handle for
/// inspection while the runtime owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every committed record, in commit order.
    pub fn log(&self) -> Vec<TransitionRecord> {
        self.lock().log.clone()
    }

    /// Make subsequent commits report `SESSION_SAVE_FAILED`.
    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }
}

impl TransitionStore for MemoryStore {
    fn initialize(&mut self, graph: &GraphStore) -> Result<()> {
        let mut inner = self.lock();
        inner.ledger = Some(Ledger::from_graph(graph));
        inner.log.clear();
        debug!(items = graph.len(), "memory session initialized");
        Ok(())
    }

    fn commit(&mut self, mut record: TransitionRecord, expected_version: u64) -> Result<u64> {
        let mut inner = self.lock();
        let ledger = inner.ledger.as_mut().ok_or_else(|| {
            PlanError::from(ExecutionError::session_save("session not initialized"))
        })?;
        let version = ledger.apply(&mut record, expected_version)?;

        if inner.fail_saves {
            return Err(ExecutionError::session_save(format!(
                "memory store refused record {} for '{}'",
                record.seq, record.item
            ))
            .for_item(&record.item)
            .into());
        }

        inner.log.push(record);
        Ok(version)
    }

    fn load(&mut self) -> Result<Option<SessionState>> {
        let inner = self.lock();
        Ok(inner
            .ledger
            .as_ref()
            .map(|ledger| ledger.state(inner.log.len(), 0)))
    }
}
