// src/state/propagation.rs

//! Bottom-up status aggregation for containers.

use tracing::debug;

use crate::dag::{GraphStore, ItemIdx};
use crate::errors::{ExecutionError, Result};
use crate::persist::{Actor, TransitionStore};
use crate::state::machine::{TransitionRequest, commit_transition};
use crate::types::{ItemLevel, Status};

/// Aggregate status of a container from its children's statuses.
///
/// Pure function of the multiset of child statuses:
/// `Failed > Blocked > InProgress > Complete > Cancelled > Planned`, where
/// `InProgress` covers any active child as well as a partial mix of
/// `Complete` and not-started children, `Complete` needs every child
/// `Complete`, and `Cancelled` needs every child terminal with at least one
/// `Cancelled`.
pub fn aggregate(children: impl IntoIterator<Item = Status>) -> Status {
    let mut any = false;
    let mut failed = false;
    let mut blocked = false;
    let mut active = false;
    let mut complete = 0usize;
    let mut cancelled = 0usize;
    let mut not_started = 0usize;
    let mut total = 0usize;

    for st in children {
        any = true;
        total += 1;
        match st {
            Status::Failed => failed = true,
            Status::Blocked => blocked = true,
            Status::Queued | Status::InProgress | Status::AwaitingReview => active = true,
            Status::Complete => complete += 1,
            Status::Cancelled => cancelled += 1,
            Status::Planned => not_started += 1,
        }
    }

    if !any {
        Status::Planned
    } else if failed {
        Status::Failed
    } else if blocked {
        Status::Blocked
    } else if active || (complete > 0 && not_started > 0) {
        Status::InProgress
    } else if complete == total {
        Status::Complete
    } else if complete + cancelled == total {
        Status::Cancelled
    } else {
        Status::Planned
    }
}

/// Container statuses changed by one propagation pass.
#[derive(Debug, Clone, Default)]
pub struct Propagation {
    pub changed: Vec<(ItemIdx, Status, Status)>,
    pub persist_errors: Vec<ExecutionError>,
}

impl Propagation {
    /// Containers that just became `Complete`.
    pub fn completed(&self) -> impl Iterator<Item = ItemIdx> + '_ {
        self.changed
            .iter()
            .filter(|(_, _, to)| *to == Status::Complete)
            .map(|(idx, _, _)| *idx)
    }

    fn merge(&mut self, other: Propagation) {
        self.changed.extend(other.changed);
        self.persist_errors.extend(other.persist_errors);
    }
}

fn set_aggregate(
    graph: &mut GraphStore,
    store: &mut dyn TransitionStore,
    container: ItemIdx,
    out: &mut Propagation,
) -> Result<bool> {
    let current = graph.status_of(container);
    let next = aggregate(graph.children(container).iter().map(|c| graph.status_of(*c)));
    if next == current {
        return Ok(false);
    }

    let req = TransitionRequest::current(graph, container, next, Actor::Propagation);
    let applied = commit_transition(graph, store, req)?;
    debug!(
        item = %graph.id_of(container),
        from = %current,
        to = %next,
        "container status recomputed"
    );
    out.changed.push((container, current, next));
    out.persist_errors.extend(applied.persist_error);
    Ok(true)
}

/// Recompute ancestors of `from`, stopping at the first unchanged aggregate.
pub fn propagate_up(
    graph: &mut GraphStore,
    store: &mut dyn TransitionStore,
    from: ItemIdx,
) -> Result<Propagation> {
    let mut out = Propagation::default();
    let mut cursor = graph.parent(from);
    while let Some(container) = cursor {
        if !set_aggregate(graph, store, container, &mut out)? {
            break;
        }
        cursor = graph.parent(container);
    }
    Ok(out)
}

/// Recompute every container, deepest level first.
pub fn reaggregate_all(
    graph: &mut GraphStore,
    store: &mut dyn TransitionStore,
) -> Result<Propagation> {
    let mut out = Propagation::default();
    for level in [ItemLevel::Task, ItemLevel::Milestone, ItemLevel::Phase] {
        let containers: Vec<ItemIdx> = graph
            .sorted_indices()
            .into_iter()
            .filter(|idx| graph.item(*idx).level() == level && !graph.is_leaf(*idx))
            .collect();
        for container in containers {
            let mut step = Propagation::default();
            set_aggregate(graph, store, container, &mut step)?;
            out.merge(step);
        }
    }
    Ok(out)
}
