// src/state/machine.rs

//! Table-driven item lifecycle.
//!
//! A transition is legal when the `(from, to)` pair is in [`is_legal`] and
//! every registered [`Guard`] that applies to it passes. Applying a
//! transition checks the caller's expected version first, then the table,
//! then the guards; only then is a [`TransitionRecord`] committed to the
//! store and the graph updated.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::dag::{GraphStore, ItemIdx};
use crate::errors::{ExecutionError, PlanError, Result};
use crate::persist::{Actor, TransitionRecord, TransitionStore};
use crate::types::Status;

/// Whether `from -> to` is in the transition table.
pub fn is_legal(from: Status, to: Status) -> bool {
    legal_targets(from).contains(&to)
}

pub fn legal_targets(from: Status) -> &'static [Status] {
    use Status::*;
    match from {
        Planned => &[Queued, InProgress, Blocked, Cancelled],
        Queued => &[InProgress, Blocked, Cancelled],
        InProgress => &[AwaitingReview, Complete, Failed, Blocked, Cancelled],
        AwaitingReview => &[Complete, Failed, Cancelled],
        Failed => &[Planned],
        Blocked => &[Planned, Cancelled],
        Complete | Cancelled => &[],
    }
}

/// Named precondition evaluated after the table check.
pub trait Guard: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn applies_to(&self, from: Status, to: Status) -> bool;

    /// `Err(reason)` refuses the transition.
    fn check(&self, graph: &GraphStore, idx: ItemIdx) -> std::result::Result<(), String>;
}

/// Entering `Queued` or `InProgress` needs every execution dependency `Complete`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependenciesComplete;

impl Guard for DependenciesComplete {
    fn name(&self) -> &'static str {
        "dependencies_complete"
    }

    fn applies_to(&self, _from: Status, to: Status) -> bool {
        matches!(to, Status::Queued | Status::InProgress)
    }

    fn check(&self, graph: &GraphStore, idx: ItemIdx) -> std::result::Result<(), String> {
        match graph
            .execution_dependencies(idx)
            .into_iter()
            .find(|d| graph.status_of(*d) != Status::Complete)
        {
            Some(dep) => Err(format!(
                "dependency '{}' is {}",
                graph.id_of(dep),
                graph.status_of(dep)
            )),
            None => Ok(()),
        }
    }
}

/// Entering `Blocked` needs some execution dependency that can no longer complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct HasUnsatisfiableDependency;

impl Guard for HasUnsatisfiableDependency {
    fn name(&self) -> &'static str {
        "has_unsatisfiable_dependency"
    }

    fn applies_to(&self, _from: Status, to: Status) -> bool {
        to == Status::Blocked
    }

    fn check(&self, graph: &GraphStore, idx: ItemIdx) -> std::result::Result<(), String> {
        match graph.unsatisfiable_dependency(idx) {
            Some(_) => Ok(()),
            None => Err("no dependency is Failed, Blocked or Cancelled".to_string()),
        }
    }
}

/// A requested status change for one item.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub idx: ItemIdx,
    pub to: Status,
    pub expected_version: u64,
    pub actor: Actor,
    pub context: BTreeMap<String, String>,
}

impl TransitionRequest {
    pub fn new(idx: ItemIdx, to: Status, expected_version: u64, actor: Actor) -> Self {
        Self {
            idx,
            to,
            expected_version,
            actor,
            context: BTreeMap::new(),
        }
    }

    /// Request built from the item's current version.
    pub fn current(graph: &GraphStore, idx: ItemIdx, to: Status, actor: Actor) -> Self {
        Self::new(idx, to, graph.item(idx).version, actor)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_error(self, err: &ExecutionError) -> Self {
        let mut req = self
            .with_context("error_code", err.code)
            .with_context("error", &err.message);
        for (k, v) in &err.context {
            req.context.entry(k.clone()).or_insert_with(|| v.clone());
        }
        req
    }
}

/// Result of an applied transition.
#[derive(Debug, Clone)]
pub struct Applied {
    pub record: TransitionRecord,
    pub version: u64,
    /// Set when the graph was updated but the store failed to persist.
    pub persist_error: Option<ExecutionError>,
}

#[derive(Debug)]
pub struct StateMachine {
    guards: Vec<Box<dyn Guard>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            guards: vec![Box::new(DependenciesComplete), Box::new(HasUnsatisfiableDependency)],
        }
    }

    pub fn register_guard(&mut self, guard: impl Guard + 'static) {
        self.guards.push(Box::new(guard));
    }

    pub fn guard_names(&self) -> Vec<&'static str> {
        self.guards.iter().map(|g| g.name()).collect()
    }

    /// Table and guard check without touching any state.
    pub fn validate(&self, graph: &GraphStore, idx: ItemIdx, to: Status) -> Result<()> {
        let from = graph.status_of(idx);
        if !is_legal(from, to) {
            return Err(PlanError::InvalidTransition {
                item: graph.id_of(idx).clone(),
                from,
                to,
            });
        }
        for guard in self.guards.iter().filter(|g| g.applies_to(from, to)) {
            if let Err(reason) = guard.check(graph, idx) {
                return Err(PlanError::GuardFailed {
                    item: graph.id_of(idx).clone(),
                    to,
                    guard: guard.name(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Whether `validate` would accept the transition.
    pub fn can_transition(&self, graph: &GraphStore, idx: ItemIdx, to: Status) -> bool {
        self.validate(graph, idx, to).is_ok()
    }

    /// Version check, table, guards, commit, graph update.
    pub fn apply(
        &self,
        graph: &mut GraphStore,
        store: &mut dyn TransitionStore,
        req: TransitionRequest,
    ) -> Result<Applied> {
        let item = graph.item(req.idx);
        if item.version != req.expected_version {
            return Err(PlanError::VersionConflict {
                item: item.id.clone(),
                expected: req.expected_version,
                actual: item.version,
            });
        }
        self.validate(graph, req.idx, req.to)?;
        commit_transition(graph, store, req)
    }

    /// Move an item whose transition was refused to `Failed`.
    ///
    /// Follows table edges only (`Planned`/`Queued` pass through
    /// `InProgress`) without consulting the guards. Returns the applied
    /// steps; empty when the item has no route to `Failed` (`Blocked` and
    /// terminal statuses).
    pub fn fail_refused(
        &self,
        graph: &mut GraphStore,
        store: &mut dyn TransitionStore,
        idx: ItemIdx,
        err: &ExecutionError,
    ) -> Result<Vec<Applied>> {
        let route: &[Status] = match graph.status_of(idx) {
            Status::Planned | Status::Queued => &[Status::InProgress, Status::Failed],
            Status::InProgress | Status::AwaitingReview => &[Status::Failed],
            _ => &[],
        };

        let mut applied = Vec::with_capacity(route.len());
        for &to in route {
            debug_assert!(is_legal(graph.status_of(idx), to));
            let req = TransitionRequest::current(graph, idx, to, Actor::Scheduler)
                .with_context("refused", "true")
                .with_error(err);
            applied.push(commit_transition(graph, store, req)?);
        }
        Ok(applied)
    }
}

/// Commit a transition without consulting the table or guards.
///
/// Used for derived container statuses. The version check still applies.
pub(crate) fn commit_transition(
    graph: &mut GraphStore,
    store: &mut dyn TransitionStore,
    req: TransitionRequest,
) -> Result<Applied> {
    let id = graph.id_of(req.idx).clone();
    let from = graph.status_of(req.idx);
    let mut record =
        TransitionRecord::new(id.clone(), from, req.to, req.actor).with_context(req.context);

    let persist_error = match store.commit(record.clone(), req.expected_version) {
        Ok(_) => None,
        Err(err) if err.is_version_conflict() => return Err(err),
        Err(PlanError::Execution(err)) => Some(err.for_item(&id)),
        Err(other) => Some(ExecutionError::session_save(other.to_string()).for_item(&id)),
    };

    let version = graph.update_status(req.idx, req.to, req.expected_version)?;
    record.version = version;

    match &persist_error {
        None => debug!(
            item = %id,
            from = %from,
            to = %req.to,
            version,
            actor = %req.actor,
            "transition committed"
        ),
        Some(err) => warn!(
            item = %id,
            from = %from,
            to = %req.to,
            version,
            error = %err,
            "transition applied in memory but not persisted"
        ),
    }

    Ok(Applied {
        record,
        version,
        persist_error,
    })
}
