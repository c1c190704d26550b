// src/exec/mod.rs

//! Item execution layer.
//!
//! This module is responsible for actually executing dispatched leaves and
//! reporting back to the orchestration runtime via `RuntimeEvent`s.
//!
//! - [`executor_loop`] owns the background loop that tracks running items
//!   and aborts them on request.
//! - [`task_runner`] runs one item through an [`ItemExecutor`] (the default
//!   [`ShellExecutor`] runs the item's command with `sh -c`).
//! - [`backend`] provides the `ExecutorBackend` trait and a concrete
//!   `RealExecutorBackend` that the runtime uses in production, and which
//!   tests can replace with a fake implementation.

pub mod backend;
pub mod executor_loop;
pub mod task_runner;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use executor_loop::{ExecutorMessage, spawn_executor};
pub use task_runner::{ItemExecutor, ShellExecutor};
