// src/exec/task_runner.rs

//! Individual item runner.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::ScheduledItem;
use crate::engine::{ItemOutcome, RuntimeEvent};
use crate::errors::ExecutionError;

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Whatever actually does the work of one leaf.
///
/// Implementations report every failure as an [`ItemOutcome::Failed`] with
/// an error code; the per-item timeout and abort handling live in
/// [`run_item`].
pub trait ItemExecutor: Send + Sync + fmt::Debug {
    fn execute<'a>(
        &'a self,
        item: &'a ScheduledItem,
    ) -> Pin<Box<dyn Future<Output = ItemOutcome> + Send + 'a>>;
}

/// Runs the item's `command` with `sh -c` (`cmd /C` on Windows).
///
/// Items without a command succeed immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl ItemExecutor for ShellExecutor {
    fn execute<'a>(
        &'a self,
        item: &'a ScheduledItem,
    ) -> Pin<Box<dyn Future<Output = ItemOutcome> + Send + 'a>> {
        Box::pin(async move {
            let Some(command) = item.command.as_deref() else {
                debug!(item = %item.id, "item has no command; nothing to run");
                return ItemOutcome::Success;
            };
            match run_command(item, command).await {
                Ok(outcome) => outcome,
                Err(err) => ItemOutcome::Failed(
                    ExecutionError::task_failed(format!("{err:#}")).for_item(&item.id),
                ),
            }
        })
    }
}

async fn run_command(item: &ScheduledItem, command: &str) -> Result<ItemOutcome> {
    info!(item = %item.id, cmd = %command, "starting item process");

    // Build a shell command appropriate for the platform.
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PLANDAG_ITEM_ID", item.id.as_str())
        .env("PLANDAG_ITEM_TITLE", &item.title)
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for item '{}'", item.id))?;

    if let Some(stdout) = child.stdout.take() {
        let id = item.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(item = %id, "stdout: {}", line);
            }
        });
    }

    let stderr_tail = child.stderr.take().map(|stderr| {
        let id = item.id.clone();
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(item = %id, "stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        })
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of item '{}'", item.id))?;

    let code = status.code().unwrap_or(-1);
    info!(item = %item.id, exit_code = code, success = status.success(), "item process exited");

    if status.success() {
        return Ok(ItemOutcome::Success);
    }

    let stderr = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    let mut err = ExecutionError::task_failed(format!("command exited with status {code}"))
        .for_item(&item.id)
        .with_context("exit_code", code);
    if !stderr.is_empty() {
        err = err.with_context("stderr", stderr);
    }
    Ok(ItemOutcome::Failed(err))
}

/// Run one item and emit its `ItemFinished` event.
///
/// - If `item.timeout` elapses first, the item fails with `AGENT_TIMEOUT`.
/// - If the cancel channel fires, execution is dropped (a child process is
///   killed on drop) and **no** event is sent for this dispatch.
pub async fn run_item(
    item: ScheduledItem,
    runner: Arc<dyn ItemExecutor>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let execution = async {
        match item.timeout {
            Some(limit) => match tokio::time::timeout(limit, runner.execute(&item)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(item = %item.id, timeout = ?limit, "item timed out");
                    ItemOutcome::Failed(
                        ExecutionError::timeout(format!("item exceeded timeout of {limit:?}"))
                            .for_item(&item.id),
                    )
                }
            },
            None => runner.execute(&item).await,
        }
    };

    let outcome = tokio::select! {
        outcome = execution => outcome,
        cancel = &mut cancel_rx => {
            match cancel {
                Ok(()) => info!(item = %item.id, "item aborted; discarding its execution"),
                Err(_) => debug!(item = %item.id, "executor loop went away; discarding execution"),
            }
            return;
        }
    };

    let event = RuntimeEvent::ItemFinished {
        id: item.id.clone(),
        dispatch_version: item.dispatch_version,
        outcome,
    };
    if runtime_tx.send(event).await.is_err() {
        debug!(item = %item.id, "runtime is gone; dropping item result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::errors::ErrorCode;

    fn scheduled(command: Option<&str>, timeout: Option<Duration>) -> ScheduledItem {
        ScheduledItem {
            id: "P1.M1".parse().unwrap(),
            dispatch_version: 7,
            title: "test".to_string(),
            command: command.map(str::to_string),
            priority: 0,
            timeout,
        }
    }

    #[tokio::test]
    async fn item_without_command_succeeds() {
        let outcome = ShellExecutor.execute(&scheduled(None, None)).await;
        assert_eq!(outcome, ItemOutcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let item = scheduled(Some("echo boom >&2; exit 3"), None);
        let ItemOutcome::Failed(err) = ShellExecutor.execute(&item).await else {
            panic!("expected failure");
        };
        assert_eq!(err.code, ErrorCode::TaskExecutionFailed);
        assert_eq!(err.context.get("exit_code").map(String::as_str), Some("3"));
        assert_eq!(err.context.get("stderr").map(String::as_str), Some("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_reports_agent_timeout() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let item = scheduled(Some("sleep 5"), Some(Duration::from_millis(50)));

        run_item(item, Arc::new(ShellExecutor), tx, cancel_rx).await;

        match rx.recv().await {
            Some(RuntimeEvent::ItemFinished {
                dispatch_version,
                outcome: ItemOutcome::Failed(err),
                ..
            }) => {
                assert_eq!(dispatch_version, 7);
                assert_eq!(err.code, ErrorCode::AgentTimeout);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn aborted_item_reports_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let item = scheduled(Some("sleep 5"), None);

        let handle = tokio::spawn(run_item(item, Arc::new(ShellExecutor), tx, cancel_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
    }
}
