// src/persist/recovery.rs

//! Resume a session after a crash or a halted run.

use serde::Serialize;
use tracing::{info, warn};

use crate::dag::{GraphStore, ItemIdx};
use crate::errors::{ExecutionError, PlanError, Result};
use crate::persist::record::Actor;
use crate::persist::store::{SessionState, TransitionStore};
use crate::state::{StateMachine, TransitionRequest, reaggregate_all};
use crate::types::Status;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Log records applied on top of the snapshot.
    pub replayed: usize,
    /// Torn or corrupt log lines dropped.
    pub discarded_tail: usize,
    /// Leaves that were running when the previous process stopped.
    pub orphaned_in_progress: usize,
    pub retried_failed: usize,
    pub reset_blocked: usize,
}

/// Apply a loaded session to `graph` and make interrupted work runnable.
///
/// Leaves found `InProgress` or `AwaitingReview` go to `Failed` and then back
/// to `Planned`. With `retry_failed`, leaves left `Failed` or `Blocked` by the
/// previous run are reset to `Planned` as well. Containers are re-aggregated
/// afterwards. Returns the stats plus any persistence errors hit while
/// recording the recovery transitions.
pub fn recover(
    graph: &mut GraphStore,
    store: &mut dyn TransitionStore,
    machine: &StateMachine,
    state: &SessionState,
    retry_failed: bool,
) -> Result<(RecoveryStats, Vec<ExecutionError>)> {
    let mut stats = RecoveryStats {
        replayed: state.replayed,
        discarded_tail: state.discarded_tail,
        ..RecoveryStats::default()
    };
    let mut persist_errors = Vec::new();

    let mut restored = 0usize;
    for item in &state.items {
        match graph.index_of(&item.id) {
            Ok(idx) => {
                graph.restore(idx, item.status, item.version);
                restored += 1;
            }
            Err(_) => {
                warn!(item = %item.id, "persisted item is not in the hierarchy; ignoring");
            }
        }
    }
    if restored != graph.len() {
        let missing: Vec<String> = graph
            .iter()
            .filter(|(_, it)| !state.items.iter().any(|p| p.id == it.id))
            .map(|(_, it)| it.id.to_string())
            .collect();
        return Err(PlanError::from(ExecutionError::session_load(format!(
            "session does not cover hierarchy items: {}",
            missing.join(", ")
        ))));
    }

    let leaves: Vec<ItemIdx> = graph
        .sorted_indices()
        .into_iter()
        .filter(|idx| graph.is_leaf(*idx))
        .collect();

    for idx in leaves {
        let status = graph.status_of(idx);
        match status {
            Status::InProgress | Status::AwaitingReview => {
                let req = TransitionRequest::current(graph, idx, Status::Failed, Actor::Recovery)
                    .with_context("reason", "interrupted before completion");
                persist_errors.extend(machine.apply(graph, store, req)?.persist_error);
                let req = TransitionRequest::current(graph, idx, Status::Planned, Actor::Recovery);
                persist_errors.extend(machine.apply(graph, store, req)?.persist_error);
                stats.orphaned_in_progress += 1;
            }
            Status::Failed | Status::Blocked if retry_failed => {
                let req = TransitionRequest::current(graph, idx, Status::Planned, Actor::Recovery)
                    .with_context("reason", "retry on resume");
                persist_errors.extend(machine.apply(graph, store, req)?.persist_error);
                if status == Status::Failed {
                    stats.retried_failed += 1;
                } else {
                    stats.reset_blocked += 1;
                }
            }
            _ => {}
        }
    }

    let prop = reaggregate_all(graph, store)?;
    persist_errors.extend(prop.persist_errors);

    info!(
        replayed = stats.replayed,
        discarded_tail = stats.discarded_tail,
        orphaned = stats.orphaned_in_progress,
        retried_failed = stats.retried_failed,
        reset_blocked = stats.reset_blocked,
        "session recovered"
    );

    Ok((stats, persist_errors))
}
