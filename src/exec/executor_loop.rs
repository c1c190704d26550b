// src/exec/executor_loop.rs

//! Main executor loop that tracks running items.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::dag::{ItemId, ScheduledItem};
use crate::engine::RuntimeEvent;
use crate::exec::task_runner::{ItemExecutor, run_item};

/// Requests accepted by the executor loop.
#[derive(Debug, Clone)]
pub enum ExecutorMessage {
    Run(ScheduledItem),
    Abort(ItemId),
}

/// Internal handle for a currently-running item.
///
/// - `cancel` stops the item; its result is then never reported.
/// - `handle` is the Tokio task that is actually running it.
struct ActiveItem {
    dispatch_version: u64,
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawn the background executor loop.
///
/// The returned sender is what `RealExecutorBackend` uses to hand over work.
/// Each item runs in its own Tokio task; there is never more than one running
/// instance per item id.
pub fn spawn_executor(
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    runner: Arc<dyn ItemExecutor>,
) -> mpsc::Sender<ExecutorMessage> {
    let (tx, mut rx) = mpsc::channel::<ExecutorMessage>(32);

    tokio::spawn(async move {
        info!("executor loop started");

        let mut active: HashMap<ItemId, ActiveItem> = HashMap::new();

        while let Some(message) = rx.recv().await {
            active.retain(|_, a| !a.handle.is_finished());
            match message {
                ExecutorMessage::Run(item) => {
                    start_item(item, &mut active, &runtime_tx, &runner);
                }
                ExecutorMessage::Abort(id) => match active.remove(&id) {
                    Some(mut existing) => cancel_item(&id, &mut existing),
                    None => debug!(item = %id, "abort for an item that is not running"),
                },
            }
        }

        for (id, mut existing) in active.drain() {
            cancel_item(&id, &mut existing);
        }
        info!("executor loop finished (channel closed)");
    });

    tx
}

fn start_item(
    item: ScheduledItem,
    active: &mut HashMap<ItemId, ActiveItem>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    runner: &Arc<dyn ItemExecutor>,
) {
    if let Some(mut existing) = active.remove(&item.id) {
        info!(
            item = %item.id,
            previous_version = existing.dispatch_version,
            version = item.dispatch_version,
            "item dispatched again; stopping the previous instance"
        );
        cancel_item(&item.id, &mut existing);
    }

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let rt_tx = runtime_tx.clone();
    let runner = Arc::clone(runner);
    let id = item.id.clone();
    let dispatch_version = item.dispatch_version;

    let handle = tokio::spawn(async move {
        let spawn_id = item.id.clone();
        run_item(item, runner, rt_tx, cancel_rx).await;
        debug!(item = %spawn_id, "item runner future finished");
    });

    active.insert(
        id,
        ActiveItem {
            dispatch_version,
            cancel: Some(cancel_tx),
            handle,
        },
    );
}

fn cancel_item(id: &ItemId, existing: &mut ActiveItem) {
    info!(item = %id, version = existing.dispatch_version, "aborting running item");

    if let Some(cancel) = existing.cancel.take() {
        if cancel.send(()).is_err() {
            debug!(item = %id, "item already finished while aborting");
        }
    }
}
