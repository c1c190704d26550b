// src/engine/runtime.rs

use std::fmt;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::dag::{ItemId, ScheduledItem, Scheduler};
use crate::errors::Result;
use crate::exec::ExecutorBackend;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent};

/// Drives the scheduler in response to `RuntimeEvent`s, and delegates
/// actual item execution to an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels, dispatching items to the executor and running the grace timer.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    grace_deadline: Option<TokioInstant>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("grace_deadline", &self.grace_deadline)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(core: CoreRuntime, event_rx: mpsc::Receiver<RuntimeEvent>, executor: E) -> Self {
        Self {
            core,
            event_rx,
            executor,
            grace_deadline: None,
        }
    }

    /// Main event loop.
    ///
    /// - Starts the run and dispatches the first batch.
    /// - Consumes `RuntimeEvent`s from `event_rx` (or the grace timer).
    /// - Feeds them into the core runtime.
    /// - Executes commands returned by the core (dispatch, abort, exit).
    ///
    /// Returns the scheduler so the caller can build a report.
    pub async fn run(mut self) -> Result<Scheduler> {
        info!("plandag runtime started");

        let step = self.core.start(Instant::now())?;
        let mut keep_running = step.keep_running;
        for command in step.commands {
            self.execute_command(command).await?;
        }

        while keep_running {
            let deadline = self.grace_deadline;
            let event = tokio::select! {
                maybe = self.event_rx.recv() => match maybe {
                    Some(e) => e,
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => RuntimeEvent::GracePeriodElapsed,
            };

            if matches!(event, RuntimeEvent::GracePeriodElapsed) {
                self.grace_deadline = None;
            }
            debug!(?event, "runtime received event");

            // Feed the event into the pure core and get commands back.
            let step = self.core.step(event, Instant::now())?;

            for command in step.commands {
                self.execute_command(command).await?;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                keep_running = false;
            }
        }

        info!("runtime exiting");
        Ok(self.core.into_scheduler())
    }

    /// Execute a single command from the core.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::DispatchItems(items) => self.dispatch(items).await?,
            CoreCommand::AbortItems(ids) => self.abort(ids).await?,
            CoreCommand::StartGraceTimer(period) => {
                if self.grace_deadline.is_none() {
                    warn!(grace = ?period, "run halted; waiting for in-flight items");
                    self.grace_deadline = Some(TokioInstant::now() + period);
                }
            }
            CoreCommand::RequestExit => {
                // keep_running=false accompanies this command; nothing else to do.
                debug!("core issued RequestExit command");
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, items: Vec<ScheduledItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        debug!(?ids, "dispatching items to executor");
        self.executor.dispatch(items).await?;
        Ok(())
    }

    async fn abort(&mut self, ids: Vec<ItemId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        debug!(?ids, "aborting items");
        self.executor.abort(ids).await?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<TokioInstant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
