// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::dag::item::ItemId;
use crate::errors::ExecutionError;

/// A leaf handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledItem {
    pub id: ItemId,
    /// Item version after the dispatching transition. Results must quote it.
    pub dispatch_version: u64,
    pub title: String,
    pub command: Option<String>,
    pub priority: u32,
    pub timeout: Option<Duration>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every executable item is `Complete`.
    Completed,
    /// Nothing left to run, but some items failed, were blocked or cancelled.
    PartialSuccess,
    /// A fatal error stopped dispatching.
    Halted,
    /// The operator cancelled the run.
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::PartialSuccess | RunOutcome::Cancelled => 2,
            RunOutcome::Halted => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::PartialSuccess => "partial success",
            RunOutcome::Halted => "halted",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured result of a single scheduler step.
///
/// Tests can drive the scheduler by hand and assert on exactly what one
/// event changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Items that moved to `InProgress` and must be executed.
    pub dispatched: Vec<ScheduledItem>,
    /// In-flight items whose execution must be aborted.
    pub aborted: Vec<ItemId>,
    pub newly_failed: Vec<ItemId>,
    pub newly_blocked: Vec<ItemId>,
    pub newly_cancelled: Vec<ItemId>,
    pub newly_completed: Vec<ItemId>,
    /// Set on the step that stopped dispatching because of a fatal error.
    pub halted: Option<ExecutionError>,
    /// Set on the step that ended the run.
    pub finished: Option<RunOutcome>,
}

impl SchedulerStep {
    pub fn dispatched_ids(&self) -> Vec<ItemId> {
        self.dispatched.iter().map(|s| s.id.clone()).collect()
    }

    pub fn merge(&mut self, other: SchedulerStep) {
        self.dispatched.extend(other.dispatched);
        self.aborted.extend(other.aborted);
        self.newly_failed.extend(other.newly_failed);
        self.newly_blocked.extend(other.newly_blocked);
        self.newly_cancelled.extend(other.newly_cancelled);
        self.newly_completed.extend(other.newly_completed);
        if self.halted.is_none() {
            self.halted = other.halted;
        }
        if self.finished.is_none() {
            self.finished = other.finished;
        }
    }
}
