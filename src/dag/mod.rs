// src/dag/mod.rs

//! Plan graph and scheduling.
//!
//! - [`item`] defines item ids, story points and the per-item record.
//! - [`graph`] is the arena of items with dependency and containment indexes.
//! - [`resolver`] computes execution levels and detects cycles.
//! - [`ready_queue`] orders runnable leaves by priority with aging.
//! - [`scheduler`] decides which leaves run, and reacts to their results.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod item;
pub mod ready_queue;
pub mod resolver;
pub mod scheduler;
pub mod scheduler_step;

pub use graph::GraphStore;
pub use item::{ADMISSIBLE_STORY_POINTS, Item, ItemId, ItemIdx, StoryPoints};
pub use ready_queue::{AgingPolicy, ReadyQueue};
pub use resolver::{DependencyResolver, Resolution};
pub use scheduler::{FailureRecord, RunPhase, Scheduler, SchedulerOptions};
pub use scheduler_step::{RunOutcome, ScheduledItem, SchedulerStep};
