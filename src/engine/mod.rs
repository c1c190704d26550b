// src/engine/mod.rs

//! Orchestration engine for plandag.
//!
//! This module ties together:
//! - the scheduler (which owns the graph, the state machine and the store)
//! - the runtime event loop that reacts to:
//!   - item results from the executor
//!   - review decisions
//!   - cancellation requests
//!   - the end of a fatal-halt grace period
//!   - shutdown signals
//!
//! The pure core lives in [`core`]; the async/IO shell is implemented in
//! [`runtime`].

use std::time::Duration;

use crate::dag::ItemId;
use crate::errors::ExecutionError;

/// What the executor reports for one dispatched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    /// Finished, but a reviewer has to approve before it counts as `Complete`.
    NeedsReview,
    Failed(ExecutionError),
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// How long in-flight items may keep running after a fatal error.
    pub grace_period: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
        }
    }
}

/// Events flowing into the runtime from executors, operators and timers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A dispatched item finished executing.
    ItemFinished {
        id: ItemId,
        dispatch_version: u64,
        outcome: ItemOutcome,
    },
    /// Decision for an item in `AwaitingReview`.
    ReviewResolved { id: ItemId, approved: bool },
    /// Cancel one item, its descendants and its dependents.
    CancelItem { id: ItemId },
    /// Stop dispatching; let in-flight items finish.
    CancelRun,
    /// The grace period started by a fatal error is over.
    GracePeriodElapsed,
    /// Leave immediately (e.g. second Ctrl-C or closed input).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;
