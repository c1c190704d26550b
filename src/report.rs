// src/report.rs

//! End-of-run summary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::dag::{ItemId, RunOutcome, Scheduler};
use crate::errors::{ErrorCode, ExecutionError, Result};
use crate::persist::RecoveryStats;
use crate::types::Status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub id: ItemId,
    pub code: ErrorCode,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedItem {
    pub id: ItemId,
    /// From the failed item down to the direct dependency that blocked `id`.
    pub chain: Vec<ItemId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<ExecutionError>,
    pub failed: Vec<FailedItem>,
    pub blocked: Vec<BlockedItem>,
    pub cancelled: Vec<ItemId>,
    /// Leaf counts per final status.
    pub counts: BTreeMap<Status, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persist_warnings: Vec<ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryStats>,
}

impl RunReport {
    /// Summarize the scheduler's final state. A run that never reached a
    /// final outcome (shutdown) is reported as `Cancelled`.
    pub fn from_scheduler(scheduler: &Scheduler, recovery: Option<RecoveryStats>) -> Self {
        let graph = scheduler.graph();

        let mut failed: Vec<FailedItem> = Vec::new();
        for record in scheduler.failures() {
            let still_failed = graph
                .get(record.id.as_str())
                .map(|it| it.status == Status::Failed)
                .unwrap_or(false);
            if still_failed && !failed.iter().any(|f| f.id == record.id) {
                failed.push(FailedItem {
                    id: record.id.clone(),
                    code: record.error.code,
                    error: record.error.message.clone(),
                });
            }
        }

        let blocked = scheduler
            .blocked_chains()
            .iter()
            .filter(|(id, _)| {
                graph
                    .get(id.as_str())
                    .map(|it| it.status == Status::Blocked)
                    .unwrap_or(false)
            })
            .map(|(id, chain)| BlockedItem {
                id: id.clone(),
                chain: chain.clone(),
            })
            .collect();

        let mut counts: BTreeMap<Status, usize> = BTreeMap::new();
        let mut cancelled = Vec::new();
        for idx in graph.sorted_indices() {
            if !graph.is_leaf(idx) {
                continue;
            }
            let status = graph.status_of(idx);
            *counts.entry(status).or_insert(0) += 1;
            if status == Status::Cancelled {
                cancelled.push(graph.id_of(idx).clone());
            }
        }

        Self {
            outcome: scheduler.outcome().unwrap_or(RunOutcome::Cancelled),
            halted_by: scheduler.halt_cause().cloned(),
            failed,
            blocked,
            cancelled,
            counts,
            persist_warnings: scheduler.persist_warnings().to_vec(),
            recovery,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}", self.outcome)?;
        if let Some(err) = &self.halted_by {
            match &err.item {
                Some(item) => writeln!(f, "  halted by {item}: {err}")?,
                None => writeln!(f, "  halted by: {err}")?,
            }
        }

        let counts: Vec<String> = self
            .counts
            .iter()
            .map(|(status, n)| format!("{status}={n}"))
            .collect();
        writeln!(f, "  leaves: {}", counts.join(" "))?;

        if !self.failed.is_empty() {
            writeln!(f, "failed ({}):", self.failed.len())?;
            for item in &self.failed {
                writeln!(f, "  - {} [{}] {}", item.id, item.code, item.error)?;
            }
        }
        if !self.blocked.is_empty() {
            writeln!(f, "blocked ({}):", self.blocked.len())?;
            for item in &self.blocked {
                let chain: Vec<&str> = item.chain.iter().map(ItemId::as_str).collect();
                writeln!(f, "  - {} (by {})", item.id, chain.join(" -> "))?;
            }
        }
        if !self.cancelled.is_empty() {
            let ids: Vec<&str> = self.cancelled.iter().map(ItemId::as_str).collect();
            writeln!(f, "cancelled ({}): {}", ids.len(), ids.join(", "))?;
        }
        if !self.persist_warnings.is_empty() {
            writeln!(f, "session write warnings: {}", self.persist_warnings.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::dag::{GraphStore, Item, SchedulerOptions};
    use crate::engine::ItemOutcome;
    use crate::persist::MemoryStore;
    use crate::state::{CodePolicy, StateMachine};

    fn id(s: &str) -> ItemId {
        s.parse().unwrap()
    }

    fn finished_run() -> Scheduler {
        let graph = GraphStore::from_items([
            Item::new(id("P1")),
            Item::new(id("P2")).with_dependencies([id("P1")]),
            Item::new(id("P3")),
        ])
        .unwrap();
        let mut s = Scheduler::new(
            graph,
            Box::new(MemoryStore::new()),
            StateMachine::new(),
            Box::new(CodePolicy::default()),
            SchedulerOptions::default(),
        )
        .unwrap();
        s.open_session(false, false).unwrap();

        let now = Instant::now();
        let start = s.start(now).unwrap();
        for item in start.dispatched {
            let outcome = if item.id == id("P1") {
                ItemOutcome::Failed(ExecutionError::task_failed("exit status 1"))
            } else {
                ItemOutcome::Success
            };
            s.complete(&item.id, item.dispatch_version, outcome, now).unwrap();
        }
        s
    }

    #[test]
    fn partial_run_lists_failures_and_block_chains() {
        let report = RunReport::from_scheduler(&finished_run(), None);

        assert_eq!(report.outcome, RunOutcome::PartialSuccess);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(
            report.failed,
            vec![FailedItem {
                id: id("P1"),
                code: ErrorCode::TaskExecutionFailed,
                error: "exit status 1".to_string(),
            }]
        );
        assert_eq!(
            report.blocked,
            vec![BlockedItem {
                id: id("P2"),
                chain: vec![id("P1")],
            }]
        );
        assert_eq!(report.counts.get(&Status::Complete), Some(&1));
        assert!(report.cancelled.is_empty());

        let text = report.to_string();
        assert!(text.starts_with("run partial success"));
        assert!(text.contains("  - P1 [TASK_EXECUTION_FAILED] exit status 1"));
        assert!(text.contains("  - P2 (by P1)"));

        let json = report.to_json().unwrap();
        assert!(json.contains("\"outcome\": \"partial_success\""));
        assert!(!json.contains("halted_by"));
    }
}
