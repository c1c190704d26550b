// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - sending `ScheduledItem`s to the executor
//! - running the grace timer
//!
//! The core takes `now` as an argument, so it can be unit tested without
//! Tokio, channels, a clock or processes.

use std::time::Instant;

use crate::dag::Scheduler;
use crate::engine::event_handlers::{
    CoreStep, commands_for, handle_cancel_item, handle_cancel_run, handle_grace_elapsed,
    handle_item_finished, handle_review, handle_shutdown,
};
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::errors::Result;

/// Pure core runtime state.
///
/// Owns the scheduler (and through it the graph and the session store) and
/// the runtime options. It has **no** channels and does not perform any IO
/// apart from the store commits the scheduler makes.
#[derive(Debug)]
pub struct CoreRuntime {
    scheduler: Scheduler,
    options: RuntimeOptions,
}

impl CoreRuntime {
    pub fn new(scheduler: Scheduler, options: RuntimeOptions) -> Self {
        Self { scheduler, options }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    pub fn into_scheduler(self) -> Scheduler {
        self.scheduler
    }

    /// Queue every runnable leaf and dispatch the first batch.
    pub fn start(&mut self, now: Instant) -> Result<CoreStep> {
        let step = self.scheduler.start(now)?;
        Ok(commands_for(step, &self.options))
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent, now: Instant) -> Result<CoreStep> {
        match event {
            RuntimeEvent::ItemFinished {
                id,
                dispatch_version,
                outcome,
            } => handle_item_finished(
                &mut self.scheduler,
                &self.options,
                id,
                dispatch_version,
                outcome,
                now,
            ),
            RuntimeEvent::ReviewResolved { id, approved } => {
                handle_review(&mut self.scheduler, &self.options, id, approved, now)
            }
            RuntimeEvent::CancelItem { id } => {
                handle_cancel_item(&mut self.scheduler, &self.options, id, now)
            }
            RuntimeEvent::CancelRun => Ok(handle_cancel_run(&mut self.scheduler, &self.options)),
            RuntimeEvent::GracePeriodElapsed => {
                handle_grace_elapsed(&mut self.scheduler, &self.options)
            }
            RuntimeEvent::ShutdownRequested => Ok(handle_shutdown(&self.scheduler)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dag::{
        AgingPolicy, GraphStore, Item, ItemId, RunOutcome, SchedulerOptions, StoryPoints,
    };
    use crate::engine::{CoreCommand, ItemOutcome};
    use crate::errors::{ErrorCode, ExecutionError};
    use crate::persist::MemoryStore;
    use crate::state::{CodePolicy, StateMachine};

    fn id(s: &str) -> ItemId {
        s.parse().unwrap()
    }

    fn core(items: Vec<Item>, max_concurrency: usize) -> CoreRuntime {
        let graph = GraphStore::from_items(items).unwrap();
        let mut scheduler = Scheduler::new(
            graph,
            Box::new(MemoryStore::new()),
            StateMachine::new(),
            Box::new(CodePolicy::default()),
            SchedulerOptions {
                max_concurrency,
                aging: AgingPolicy::disabled(),
                ..SchedulerOptions::default()
            },
        )
        .unwrap();
        scheduler.open_session(false, false).unwrap();
        CoreRuntime::new(
            scheduler,
            RuntimeOptions {
                grace_period: Duration::from_secs(5),
            },
        )
    }

    fn leaf(s: &str, deps: &[&str]) -> Item {
        let mut it = Item::new(id(s)).with_dependencies(deps.iter().map(|d| id(d)));
        if s.contains(".S") {
            it.story_points = Some(StoryPoints::try_from(2).unwrap());
        }
        it
    }

    fn finished(id: &ItemId, version: u64, outcome: ItemOutcome) -> RuntimeEvent {
        RuntimeEvent::ItemFinished {
            id: id.clone(),
            dispatch_version: version,
            outcome,
        }
    }

    #[test]
    fn start_dispatches_roots_and_completion_requests_exit() {
        let now = Instant::now();
        let mut core = core(vec![leaf("P1", &[]), leaf("P2", &["P1"])], 2);

        let step = core.start(now).unwrap();
        assert_eq!(step.dispatched_ids(), vec![id("P1")]);
        assert!(step.keep_running);
        let v1 = step.scheduled.dispatched[0].dispatch_version;

        let step = core.step(finished(&id("P1"), v1, ItemOutcome::Success), now).unwrap();
        assert_eq!(step.dispatched_ids(), vec![id("P2")]);
        let v2 = step.scheduled.dispatched[0].dispatch_version;

        let step = core.step(finished(&id("P2"), v2, ItemOutcome::Success), now).unwrap();
        assert!(!step.keep_running);
        assert_eq!(step.commands, vec![CoreCommand::RequestExit]);
        assert_eq!(core.scheduler().outcome(), Some(RunOutcome::Completed));
    }

    #[test]
    fn fatal_error_starts_grace_timer_then_aborts() {
        let now = Instant::now();
        let mut core = core(vec![leaf("P1", &[]), leaf("P2", &[]), leaf("P3", &[])], 2);
        let step = core.start(now).unwrap();
        let v1 = step.scheduled.dispatched[0].dispatch_version;

        let fatal = ExecutionError::new(ErrorCode::ConfigMissing, "no agent configured");
        let step = core
            .step(finished(&id("P1"), v1, ItemOutcome::Failed(fatal)), now)
            .unwrap();
        assert!(step.keep_running);
        assert_eq!(
            step.commands,
            vec![CoreCommand::StartGraceTimer(Duration::from_secs(5))]
        );

        let step = core.step(RuntimeEvent::GracePeriodElapsed, now).unwrap();
        assert_eq!(
            step.commands,
            vec![
                CoreCommand::AbortItems(vec![id("P2")]),
                CoreCommand::RequestExit
            ]
        );
        assert_eq!(core.scheduler().outcome(), Some(RunOutcome::Halted));
        let p2 = core.scheduler().graph().get("P2").unwrap();
        assert_eq!(p2.status, crate::types::Status::Failed);
        assert_eq!(core.scheduler().graph().get("P3").unwrap().status, crate::types::Status::Queued);
    }

    #[test]
    fn shutdown_aborts_in_flight_without_finishing() {
        let now = Instant::now();
        let mut core = core(vec![leaf("P1", &[])], 1);
        core.start(now).unwrap();

        let step = core.step(RuntimeEvent::ShutdownRequested, now).unwrap();
        assert!(!step.keep_running);
        assert_eq!(
            step.commands,
            vec![
                CoreCommand::AbortItems(vec![id("P1")]),
                CoreCommand::RequestExit
            ]
        );
        assert!(!core.is_finished());
    }
}
