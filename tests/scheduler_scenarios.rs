// tests/scheduler_scenarios.rs

mod common;
use crate::common::{
    ItemBuilder, PlanBuilder, finish, id, ids, init_tracing, memory_scheduler,
    scheduler_with_machine, scheduler_with_store, status,
};

use std::time::Instant;

use plandag::dag::{GraphStore, ItemIdx, RunOutcome, RunPhase};
use plandag::engine::ItemOutcome;
use plandag::errors::{ErrorCode, ExecutionError};
use plandag::persist::{Actor, MemoryStore};
use plandag::report::RunReport;
use plandag::state::{CodePolicy, Guard, StateMachine};
use plandag::types::Status;

fn independent(n: usize) -> PlanBuilder {
    (1..=n).fold(PlanBuilder::new(), |b, i| b.with(&format!("P{i}"), &[]))
}

#[test]
fn failed_subtask_blocks_its_dependent_and_siblings_continue() {
    init_tracing();
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .with("P1", &[])
        .with("P1.M1", &[])
        .with("P1.M1.T1", &[])
        .with("P1.M1.T1.S1", &[])
        .with("P1.M1.T1.S2", &["P1.M1.T1.S1"])
        .with("P1.M1.T1.S3", &[])
        .graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 2);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P1.M1.T1.S1", "P1.M1.T1.S3"]));

    let err = ExecutionError::task_failed("exit status 1");
    let step = finish(&mut s, &start, "P1.M1.T1.S1", ItemOutcome::Failed(err), now);
    assert_eq!(step.newly_failed, ids(&["P1.M1.T1.S1"]));
    assert_eq!(step.newly_blocked, ids(&["P1.M1.T1.S2"]));
    assert!(step.halted.is_none());
    assert!(step.finished.is_none());

    let g = s.graph();
    assert_eq!(status(g, "P1.M1.T1.S1"), Status::Failed);
    assert_eq!(status(g, "P1.M1.T1.S2"), Status::Blocked);
    assert_eq!(status(g, "P1.M1.T1.S3"), Status::InProgress);
    assert_eq!(status(g, "P1.M1.T1"), Status::Failed);
    assert_eq!(
        s.blocked_chains().get(&id("P1.M1.T1.S2")),
        Some(&ids(&["P1.M1.T1.S1"]))
    );

    let step = finish(&mut s, &start, "P1.M1.T1.S3", ItemOutcome::Success, now);
    assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));
    assert_eq!(s.failures().len(), 1);
    assert_eq!(s.failures()[0].error.item, Some(id("P1.M1.T1.S1")));
}

#[test]
fn blocking_follows_transitive_chain() {
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .with("P1", &[])
        .with("P2", &["P1"])
        .with("P3", &["P2"])
        .with("P4", &[])
        .graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 4);
    let start = s.start(now).unwrap();

    let err = ExecutionError::new(ErrorCode::AgentLlmFailed, "model unavailable");
    let step = finish(&mut s, &start, "P1", ItemOutcome::Failed(err), now);
    assert_eq!(step.newly_blocked, ids(&["P2", "P3"]));
    assert_eq!(s.blocked_chains().get(&id("P3")), Some(&ids(&["P1", "P2"])));
    assert_eq!(status(s.graph(), "P4"), Status::InProgress);
}

#[test]
fn fatal_error_halts_dispatch_while_in_flight_items_finish() {
    let now = Instant::now();
    let mut s = memory_scheduler(independent(5).graph(), CodePolicy::default(), 3);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P1", "P2", "P3"]));

    let fatal = ExecutionError::session_save("disk full");
    let step = finish(&mut s, &start, "P1", ItemOutcome::Failed(fatal), now);
    let halted = step.halted.expect("run halted");
    assert_eq!(halted.code, ErrorCode::SessionSaveFailed);
    assert!(step.dispatched.is_empty());
    assert!(matches!(s.phase(), RunPhase::Halting(_)));

    let step = finish(&mut s, &start, "P2", ItemOutcome::Success, now);
    assert!(step.dispatched.is_empty());
    assert!(step.finished.is_none());

    let step = finish(&mut s, &start, "P3", ItemOutcome::Success, now);
    assert!(step.dispatched.is_empty());
    assert_eq!(step.finished, Some(RunOutcome::Halted));

    let g = s.graph();
    assert_eq!(status(g, "P2"), Status::Complete);
    assert_eq!(status(g, "P3"), Status::Complete);
    assert_eq!(status(g, "P4"), Status::Queued);
    assert_eq!(s.halt_cause().map(|e| e.code), Some(ErrorCode::SessionSaveFailed));
}

#[test]
fn continue_on_error_only_fails_the_item() {
    let now = Instant::now();
    let policy = CodePolicy::new(plandag::state::DEFAULT_FATAL_CODES, true);
    let mut s = memory_scheduler(independent(4).graph(), policy, 3);

    let start = s.start(now).unwrap();
    let fatal = ExecutionError::session_save("disk full");
    let step = finish(&mut s, &start, "P1", ItemOutcome::Failed(fatal), now);

    assert!(step.halted.is_none());
    assert_eq!(step.dispatched_ids(), ids(&["P4"]));
    assert_eq!(status(s.graph(), "P1"), Status::Failed);
    assert_eq!(*s.phase(), RunPhase::Running);
}

#[test]
fn store_failure_is_classified_by_policy() {
    let now = Instant::now();
    let store = MemoryStore::new();
    let mut s = scheduler_with_store(
        independent(2).graph(),
        Box::new(store.clone()),
        CodePolicy::default(),
        1,
    );
    let start = s.start(now).unwrap();

    store.fail_saves(true);
    let step = finish(&mut s, &start, "P1", ItemOutcome::Success, now);

    let halted = step.halted.expect("save failure is fatal by default");
    assert_eq!(halted.code, ErrorCode::SessionSaveFailed);
    assert_eq!(halted.item, Some(id("P1")));
    // The in-memory transition still happened.
    assert_eq!(status(s.graph(), "P1"), Status::Complete);
    assert_eq!(step.finished, Some(RunOutcome::Halted));
}

#[test]
fn stale_result_is_discarded() {
    let now = Instant::now();
    let mut s = memory_scheduler(independent(1).graph(), CodePolicy::default(), 1);
    let start = s.start(now).unwrap();
    let version = start.dispatched[0].dispatch_version;

    let step = s
        .complete(&id("P1"), version - 1, ItemOutcome::Success, now)
        .unwrap();
    assert!(step.newly_completed.is_empty());
    assert_eq!(status(s.graph(), "P1"), Status::InProgress);
    assert_eq!(s.in_flight_ids(), ids(&["P1"]));

    let step = s.complete(&id("P1"), version, ItemOutcome::Success, now).unwrap();
    assert_eq!(step.newly_completed, ids(&["P1"]));
    assert_eq!(step.finished, Some(RunOutcome::Completed));
}

#[test]
fn result_after_cancellation_is_ignored() {
    let now = Instant::now();
    let graph = PlanBuilder::new().with("P1", &[]).with("P2", &["P1"]).graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 1);
    let start = s.start(now).unwrap();

    let step = s.cancel_item(&id("P1"), now).unwrap();
    assert_eq!(step.aborted, ids(&["P1"]));
    assert_eq!(step.newly_cancelled, ids(&["P1", "P2"]));
    assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));

    let late = finish(&mut s, &start, "P1", ItemOutcome::Success, now);
    assert!(late.newly_completed.is_empty());
    assert_eq!(status(s.graph(), "P1"), Status::Cancelled);
}

#[test]
fn inherited_priority_dispatches_prerequisites_first() {
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .item(ItemBuilder::new("P1"))
        .item(ItemBuilder::new("P2").priority(5))
        .item(ItemBuilder::new("P3").after("P1").priority(9))
        .graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 1);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P1"]));
    assert_eq!(s.graph().get("P1").unwrap().priority, 9);
    assert_eq!(s.graph().get("P1").unwrap().base_priority, 0);

    let step = finish(&mut s, &start, "P1", ItemOutcome::Success, now);
    assert_eq!(step.dispatched_ids(), ids(&["P3"]));
}

#[test]
fn container_completion_releases_dependents_of_the_container() {
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .with("P1", &[])
        .with("P1.M1", &[])
        .with("P1.M2", &[])
        .with("P2", &["P1"])
        .graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 4);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P1.M1", "P1.M2"]));

    let step = finish(&mut s, &start, "P1.M1", ItemOutcome::Success, now);
    assert!(step.dispatched.is_empty());
    assert_eq!(status(s.graph(), "P1"), Status::InProgress);

    let step = finish(&mut s, &start, "P1.M2", ItemOutcome::Success, now);
    assert_eq!(status(s.graph(), "P1"), Status::Complete);
    assert_eq!(step.dispatched_ids(), ids(&["P2"]));
}

#[test]
fn review_rejection_fails_with_validation_code() {
    let now = Instant::now();
    let mut s = memory_scheduler(independent(1).graph(), CodePolicy::default(), 1);
    let start = s.start(now).unwrap();

    finish(&mut s, &start, "P1", ItemOutcome::NeedsReview, now);
    assert_eq!(status(s.graph(), "P1"), Status::AwaitingReview);

    let step = s.resolve_review(&id("P1"), false, now).unwrap();
    assert_eq!(step.newly_failed, ids(&["P1"]));
    assert_eq!(s.failures()[0].error.code, ErrorCode::TaskValidationFailed);
    assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));
}

#[test]
fn transitions_are_recorded_with_actors() {
    let now = Instant::now();
    let store = MemoryStore::new();
    let graph = PlanBuilder::new().with("P1", &[]).with("P1.M1", &[]).graph();
    let mut s = scheduler_with_store(graph, Box::new(store.clone()), CodePolicy::default(), 1);
    let start = s.start(now).unwrap();
    finish(&mut s, &start, "P1.M1", ItemOutcome::Success, now);

    let log = store.log();
    let leaf: Vec<(Status, Actor)> = log
        .iter()
        .filter(|r| r.item == id("P1.M1"))
        .map(|r| (r.to, r.actor))
        .collect();
    assert_eq!(
        leaf,
        vec![
            (Status::Queued, Actor::Scheduler),
            (Status::InProgress, Actor::Scheduler),
            (Status::Complete, Actor::Executor),
        ]
    );
    assert!(
        log.iter()
            .any(|r| r.item == id("P1") && r.to == Status::Complete && r.actor == Actor::Propagation)
    );
    let seqs: Vec<u64> = log.iter().map(|r| r.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn soft_dependency_orders_dispatch_without_blocking() {
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .item(ItemBuilder::new("P1"))
        .item(ItemBuilder::new("P2").soft_after("P3"))
        .item(ItemBuilder::new("P3"))
        .graph();
    let mut s = memory_scheduler(graph, CodePolicy::default(), 1);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P1"]));
    let step = finish(&mut s, &start, "P1", ItemOutcome::Success, now);
    assert_eq!(step.dispatched_ids(), ids(&["P3"]));

    let err = ExecutionError::task_failed("exit status 1");
    let step = finish(&mut s, &step, "P3", ItemOutcome::Failed(err), now);
    assert!(step.newly_blocked.is_empty());
    assert_eq!(step.dispatched_ids(), ids(&["P2"]));
}

/// Refuses to start one named item.
#[derive(Debug)]
struct HoldItem(&'static str);

impl Guard for HoldItem {
    fn name(&self) -> &'static str {
        "hold_item"
    }

    fn applies_to(&self, _from: Status, to: Status) -> bool {
        to == Status::InProgress
    }

    fn check(&self, graph: &GraphStore, idx: ItemIdx) -> Result<(), String> {
        if graph.id_of(idx).as_str() == self.0 {
            Err("item is on hold".to_string())
        } else {
            Ok(())
        }
    }
}

#[test]
fn refused_dispatch_fails_the_item_and_blocks_dependents() {
    let now = Instant::now();
    let graph = PlanBuilder::new()
        .with("P1", &[])
        .with("P2", &["P1"])
        .with("P3", &["P2"])
        .with("P4", &[])
        .graph();
    let mut machine = StateMachine::new();
    machine.register_guard(HoldItem("P1"));
    let mut s = scheduler_with_machine(graph, machine, 4);

    let start = s.start(now).unwrap();
    assert_eq!(start.dispatched_ids(), ids(&["P4"]));
    assert_eq!(start.newly_failed, ids(&["P1"]));
    assert_eq!(start.newly_blocked, ids(&["P2", "P3"]));
    assert!(start.halted.is_none());

    let g = s.graph();
    assert_eq!(status(g, "P1"), Status::Failed);
    assert_eq!(status(g, "P2"), Status::Blocked);
    assert_eq!(status(g, "P3"), Status::Blocked);
    assert_eq!(s.blocked_chains().get(&id("P3")), Some(&ids(&["P1", "P2"])));
    let failure = &s.failures()[0];
    assert_eq!(failure.id, id("P1"));
    assert_eq!(failure.error.code, ErrorCode::InvalidTransition);
    assert_eq!(failure.error.context.get("guard").map(String::as_str), Some("hold_item"));

    let step = finish(&mut s, &start, "P4", ItemOutcome::Success, now);
    assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));

    let report = RunReport::from_scheduler(&s, None);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, id("P1"));
    assert_eq!(report.failed[0].code, ErrorCode::InvalidTransition);
    let blocked: Vec<_> = report.blocked.iter().map(|b| b.id.clone()).collect();
    assert_eq!(blocked, ids(&["P2", "P3"]));
}

#[test]
fn refused_result_fails_the_item_instead_of_leaving_it_running() {
    #[derive(Debug)]
    struct NoCompletion;

    impl Guard for NoCompletion {
        fn name(&self) -> &'static str {
            "no_completion"
        }
        fn applies_to(&self, _from: Status, to: Status) -> bool {
            to == Status::Complete
        }
        fn check(&self, _graph: &GraphStore, _idx: ItemIdx) -> Result<(), String> {
            Err("completion disabled".to_string())
        }
    }

    let now = Instant::now();
    let graph = PlanBuilder::new().with("P1", &[]).with("P2", &["P1"]).graph();
    let mut machine = StateMachine::new();
    machine.register_guard(NoCompletion);
    let mut s = scheduler_with_machine(graph, machine, 1);

    let start = s.start(now).unwrap();
    let step = finish(&mut s, &start, "P1", ItemOutcome::Success, now);
    assert_eq!(step.newly_failed, ids(&["P1"]));
    assert_eq!(step.newly_blocked, ids(&["P2"]));
    assert!(s.in_flight_ids().is_empty());
    assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));
}
