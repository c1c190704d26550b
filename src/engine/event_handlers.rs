// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.
//!
//! Each handler drives the scheduler for one event and translates the
//! resulting [`SchedulerStep`] into commands for the IO shell.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::dag::{ItemId, ScheduledItem, Scheduler, SchedulerStep};
use crate::engine::{ItemOutcome, RuntimeOptions};
use crate::errors::Result;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Send these items to the executor.
    DispatchItems(Vec<ScheduledItem>),
    /// Stop executing these items; their results will be ignored.
    AbortItems(Vec<ItemId>),
    /// Deliver `GracePeriodElapsed` after this long.
    StartGraceTimer(Duration),
    /// The run is over; the shell should stop reading events.
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
    /// What the scheduler changed while handling the event.
    pub scheduled: SchedulerStep,
}

impl CoreStep {
    pub fn dispatched_ids(&self) -> Vec<ItemId> {
        self.scheduled.dispatched_ids()
    }
}

/// Translate a scheduler step into shell commands.
///
/// Aborts go first so a slot freed by a cancellation is not over-committed
/// when the next dispatch reaches the executor.
pub fn commands_for(step: SchedulerStep, options: &RuntimeOptions) -> CoreStep {
    let mut commands = Vec::new();

    if !step.aborted.is_empty() {
        commands.push(CoreCommand::AbortItems(step.aborted.clone()));
    }
    if !step.dispatched.is_empty() {
        commands.push(CoreCommand::DispatchItems(step.dispatched.clone()));
    }

    let mut keep_running = true;
    if let Some(outcome) = step.finished {
        info!(outcome = %outcome, "run finished; requesting exit");
        commands.push(CoreCommand::RequestExit);
        keep_running = false;
    } else if step.halted.is_some() {
        debug!(grace = ?options.grace_period, "halted with work in flight; starting grace timer");
        commands.push(CoreCommand::StartGraceTimer(options.grace_period));
    }

    CoreStep {
        commands,
        keep_running,
        scheduled: step,
    }
}

pub fn handle_item_finished(
    scheduler: &mut Scheduler,
    options: &RuntimeOptions,
    id: ItemId,
    dispatch_version: u64,
    outcome: ItemOutcome,
    now: Instant,
) -> Result<CoreStep> {
    let step = scheduler.complete(&id, dispatch_version, outcome, now)?;
    Ok(commands_for(step, options))
}

pub fn handle_review(
    scheduler: &mut Scheduler,
    options: &RuntimeOptions,
    id: ItemId,
    approved: bool,
    now: Instant,
) -> Result<CoreStep> {
    let step = scheduler.resolve_review(&id, approved, now)?;
    Ok(commands_for(step, options))
}

pub fn handle_cancel_item(
    scheduler: &mut Scheduler,
    options: &RuntimeOptions,
    id: ItemId,
    now: Instant,
) -> Result<CoreStep> {
    let step = scheduler.cancel_item(&id, now)?;
    Ok(commands_for(step, options))
}

pub fn handle_cancel_run(scheduler: &mut Scheduler, options: &RuntimeOptions) -> CoreStep {
    let step = scheduler.cancel_run();
    commands_for(step, options)
}

pub fn handle_grace_elapsed(scheduler: &mut Scheduler, options: &RuntimeOptions) -> Result<CoreStep> {
    let step = scheduler.grace_elapsed()?;
    Ok(commands_for(step, options))
}

/// Leave now. In-flight items are aborted and stay `InProgress` in the
/// session, so a resumed run treats them as interrupted.
pub fn handle_shutdown(scheduler: &Scheduler) -> CoreStep {
    let in_flight = scheduler.in_flight_ids();
    info!(in_flight = in_flight.len(), "shutdown requested");

    let mut commands = Vec::new();
    if !in_flight.is_empty() {
        commands.push(CoreCommand::AbortItems(in_flight));
    }
    commands.push(CoreCommand::RequestExit);

    CoreStep {
        commands,
        keep_running: false,
        scheduled: SchedulerStep::default(),
    }
}
