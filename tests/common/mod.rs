#![allow(dead_code)]

pub use plandag_test_utils::builders::{
    ItemBuilder, PlanBuilder, id, memory_scheduler, scheduler_with_machine, scheduler_with_store,
    test_options,
};
pub use plandag_test_utils::init_tracing;

use plandag::dag::{GraphStore, ItemId, Scheduler, SchedulerStep};
use plandag::engine::ItemOutcome;
use plandag::types::Status;
use std::time::Instant;

pub fn ids(names: &[&str]) -> Vec<ItemId> {
    names.iter().map(|s| id(s)).collect()
}

pub fn status(graph: &GraphStore, item: &str) -> Status {
    graph.get(item).expect("item exists").status
}

/// Report `outcome` for a dispatched item, using its dispatch version.
pub fn finish(
    scheduler: &mut Scheduler,
    step: &SchedulerStep,
    item: &str,
    outcome: ItemOutcome,
    now: Instant,
) -> SchedulerStep {
    let scheduled = step
        .dispatched
        .iter()
        .find(|s| s.id.as_str() == item)
        .unwrap_or_else(|| panic!("{item} was not dispatched in this step"));
    scheduler
        .complete(&scheduled.id, scheduled.dispatch_version, outcome, now)
        .expect("complete")
}
