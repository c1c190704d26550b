// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of a raw mpsc sender.
//! This makes it easy to swap in a fake executor in tests while keeping the
//! production executor implementation in [`super::executor_loop`].
//!
//! - `RealExecutorBackend` is the default implementation used by `plandag`.
//!   It wraps the `spawn_executor` loop and forwards dispatch and abort
//!   requests over an mpsc channel.
//! - Tests can provide their own `ExecutorBackend` that, for example, records
//!   which items were dispatched and directly emits `ItemFinished` events.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dag::{ItemId, ScheduledItem};
use crate::engine::RuntimeEvent;
use crate::errors::{Error, Result};

use super::executor_loop::{ExecutorMessage, spawn_executor};
use super::task_runner::ItemExecutor;

/// Trait abstracting how dispatched items are executed.
///
/// Production code uses [`RealExecutorBackend`]; tests can provide their own
/// implementation that doesn't spawn real processes.
pub trait ExecutorBackend: Send {
    /// Start executing the given items.
    ///
    /// Every item must eventually produce exactly one `ItemFinished` event
    /// quoting its `dispatch_version`, unless it is aborted first.
    fn dispatch(
        &mut self,
        items: Vec<ScheduledItem>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Stop executing the given items. No result is reported for them.
    fn abort(&mut self, ids: Vec<ItemId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Real executor backend used in production.
pub struct RealExecutorBackend {
    tx: mpsc::Sender<ExecutorMessage>,
}

impl RealExecutorBackend {
    /// Create a new backend that runs items through `runner` and reports to
    /// `runtime_tx`.
    ///
    /// This spawns the background executor loop immediately.
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, runner: Arc<dyn ItemExecutor>) -> Self {
        let tx = spawn_executor(runtime_tx, runner);
        Self { tx }
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn dispatch(
        &mut self,
        items: Vec<ScheduledItem>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for item in items {
                tx.send(ExecutorMessage::Run(item))
                    .await
                    .map_err(Error::from)?;
            }
            Ok(())
        })
    }

    fn abort(&mut self, ids: Vec<ItemId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.tx.clone();

        Box::pin(async move {
            for id in ids {
                tx.send(ExecutorMessage::Abort(id))
                    .await
                    .map_err(Error::from)?;
            }
            Ok(())
        })
    }
}
