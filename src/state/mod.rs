// src/state/mod.rs

//! Item lifecycle.
//!
//! - [`machine`] holds the transition table, guards and the single apply path.
//! - [`propagation`] derives container statuses from their children.
//! - [`classify`] decides whether an execution error halts the run.

pub mod classify;
pub mod machine;
pub mod propagation;

pub use classify::{CodePolicy, DEFAULT_FATAL_CODES, FatalityPolicy, Severity};
pub use machine::{
    Applied, DependenciesComplete, Guard, HasUnsatisfiableDependency, StateMachine,
    TransitionRequest, is_legal,
};
pub use propagation::{Propagation, aggregate, propagate_up, reaggregate_all};
