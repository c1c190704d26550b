use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plandag::dag::{ItemId, ScheduledItem};
use plandag::engine::{ItemOutcome, RuntimeEvent};
use plandag::errors::Result;
use plandag::exec::ExecutorBackend;
use tokio::sync::mpsc;

/// What the fake executor saw, shared with the test.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    pub dispatched: Vec<ItemId>,
    pub aborted: Vec<ItemId>,
}

/// A fake executor that:
/// - records which items were dispatched and aborted
/// - reports a scripted outcome for each item (default: success), either
///   immediately or after `delay`
/// - never reports an item that was aborted before its delay elapsed.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    log: Arc<Mutex<ExecutionLog>>,
    outcomes: HashMap<ItemId, ItemOutcome>,
    delays: HashMap<ItemId, Duration>,
    aborted: Arc<Mutex<HashSet<ItemId>>>,
}

impl FakeExecutor {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, log: Arc<Mutex<ExecutionLog>>) -> Self {
        Self {
            runtime_tx,
            log,
            outcomes: HashMap::new(),
            delays: HashMap::new(),
            aborted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_outcome(mut self, id: &ItemId, outcome: ItemOutcome) -> Self {
        self.outcomes.insert(id.clone(), outcome);
        self
    }

    pub fn with_delay(mut self, id: &ItemId, delay: Duration) -> Self {
        self.delays.insert(id.clone(), delay);
        self
    }
}

impl ExecutorBackend for FakeExecutor {
    fn dispatch(
        &mut self,
        items: Vec<ScheduledItem>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for item in items {
                self.log.lock().unwrap().dispatched.push(item.id.clone());

                let outcome = self
                    .outcomes
                    .get(&item.id)
                    .cloned()
                    .unwrap_or(ItemOutcome::Success);
                let event = RuntimeEvent::ItemFinished {
                    id: item.id.clone(),
                    dispatch_version: item.dispatch_version,
                    outcome,
                };

                match self.delays.get(&item.id).copied() {
                    None => {
                        self.runtime_tx
                            .send(event)
                            .await
                            .map_err(anyhow::Error::from)?;
                    }
                    Some(delay) => {
                        let tx = self.runtime_tx.clone();
                        let aborted = Arc::clone(&self.aborted);
                        let id = item.id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if aborted.lock().unwrap().contains(&id) {
                                return;
                            }
                            let _ = tx.send(event).await;
                        });
                    }
                }
            }
            Ok(())
        })
    }

    fn abort(&mut self, ids: Vec<ItemId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut log = self.log.lock().unwrap();
            let mut aborted = self.aborted.lock().unwrap();
            for id in ids {
                aborted.insert(id.clone());
                log.aborted.push(id);
            }
            Ok(())
        })
    }
}
