// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod persist;
pub mod report;
pub mod state;
pub mod types;

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use petgraph::dot::{Config as DotConfig, Dot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{RunConfig, load_hierarchy, load_run_config};
use crate::dag::{DependencyResolver, GraphStore, Scheduler};
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent};
use crate::exec::{RealExecutorBackend, ShellExecutor};
use crate::persist::{FileStore, MemoryStore, RecoveryStats, TransitionStore};
use crate::report::RunReport;
use crate::state::StateMachine;
use crate::types::{ItemLevel, PersistenceMode};

/// High-level entry point used by `main.rs`. Returns the process exit code.
///
/// This wires together:
/// - config and hierarchy loading
/// - session store, recovery and scheduler
/// - runtime and shell executor
/// - Ctrl-C handling (first: cancel the run, second: leave now)
/// - the end-of-run report
pub async fn run(args: CliArgs) -> Result<i32> {
    let mut cfg = load_run_config(args.config.as_deref())?;
    apply_overrides(&mut cfg, &args);

    let graph = load_hierarchy(&args.tasks)
        .with_context(|| format!("loading hierarchy from '{}'", args.tasks.display()))?;

    if args.dot {
        print!("{}", render_dot(&graph));
        return Ok(0);
    }
    if args.dry_run {
        print!("{}", render_levels(&graph)?);
        return Ok(0);
    }

    let (scheduler, recovery) = build_scheduler(graph, &cfg, args.resume)?;
    if let Some(stats) = &recovery {
        info!(?stats, "session resumed");
    }

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    let executor = RealExecutorBackend::new(rt_tx.clone(), Arc::new(ShellExecutor));

    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            for event in [RuntimeEvent::CancelRun, RuntimeEvent::ShutdownRequested] {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
                info!(?event, "Ctrl+C received");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
    }

    let core = CoreRuntime::new(scheduler, cfg.runtime_options());
    let runtime = Runtime::new(core, rt_rx, executor);
    let mut scheduler = runtime.run().await?;

    if let Err(e) = scheduler.checkpoint() {
        warn!(error = %e, "final session checkpoint failed");
    }

    let report = RunReport::from_scheduler(&scheduler, recovery);
    print!("{report}");
    if let Some(path) = &args.report_json {
        report
            .write_json(path)
            .with_context(|| format!("writing report to '{}'", path.display()))?;
    }
    Ok(report.exit_code())
}

fn apply_overrides(cfg: &mut RunConfig, args: &CliArgs) {
    if let Some(n) = args.max_concurrency {
        cfg.scheduler.max_concurrency = n.max(1);
    }
    if args.continue_on_error {
        cfg.run.continue_on_error = true;
    }
    if args.retry_failed {
        cfg.run.retry_failed_on_resume = true;
    }
    if let Some(dir) = &args.session {
        cfg.session.dir = dir.clone();
    }
    debug!(?cfg, "effective run config");
}

/// Open the configured session store and build a scheduler on it.
///
/// With `resume`, the stored session (if any) is recovered; otherwise a
/// fresh session is initialized.
pub fn build_scheduler(
    graph: GraphStore,
    cfg: &RunConfig,
    resume: bool,
) -> crate::errors::Result<(Scheduler, Option<RecoveryStats>)> {
    let store: Box<dyn TransitionStore> = match cfg.session.mode {
        PersistenceMode::File => Box::new(FileStore::open(
            cfg.session.dir.clone(),
            cfg.session.snapshot_every,
        )?),
        PersistenceMode::Memory => Box::new(MemoryStore::new()),
    };

    let mut scheduler = Scheduler::new(
        graph,
        store,
        StateMachine::new(),
        Box::new(cfg.fatality_policy()),
        cfg.scheduler_options(),
    )?;
    let recovery = scheduler.open_session(resume, cfg.run.retry_failed_on_resume)?;
    Ok((scheduler, recovery))
}

/// Execution levels, one line per level (dry-run output).
pub fn render_levels(graph: &GraphStore) -> crate::errors::Result<String> {
    let resolution = DependencyResolver::resolve(graph)?;
    let counts = graph.count_by_level();
    let breakdown: Vec<String> = [
        ItemLevel::Phase,
        ItemLevel::Milestone,
        ItemLevel::Task,
        ItemLevel::Subtask,
    ]
    .iter()
    .filter_map(|lvl| counts.get(lvl).map(|n| format!("{lvl}: {n}")))
    .collect();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "plandag dry-run: {} items ({}), {} levels",
        graph.len(),
        breakdown.join(", "),
        resolution.levels().len()
    );
    for (level, ids) in resolution.level_ids(graph).iter().enumerate() {
        let names: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        let _ = writeln!(out, "  level {level}: {}", names.join(", "));
    }
    Ok(out)
}

/// Explicit dependency graph in Graphviz DOT format.
pub fn render_dot(graph: &GraphStore) -> String {
    let view = graph.to_petgraph();
    format!("{:?}", Dot::with_config(&view, &[DotConfig::EdgeNoLabel]))
}
