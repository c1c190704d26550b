// src/dag/scheduler.rs

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dag::graph::GraphStore;
use crate::dag::item::{ItemId, ItemIdx};
use crate::dag::ready_queue::{AgingPolicy, ReadyQueue};
use crate::dag::resolver::{DependencyResolver, Resolution, inherit_priorities};
use crate::dag::scheduler_step::{RunOutcome, ScheduledItem, SchedulerStep};
use crate::engine::ItemOutcome;
use crate::errors::{ErrorCode, ExecutionError, PlanError, Result};
use crate::persist::{
    Actor, DEFAULT_CONFLICT_ATTEMPTS, RecoveryStats, TransitionStore, recover, with_conflict_retry,
};
use crate::state::{
    Applied, FatalityPolicy, Severity, StateMachine, TransitionRequest, propagate_up,
    reaggregate_all,
};
use crate::types::Status;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub max_concurrency: usize,
    pub aging: AgingPolicy,
    /// Passed to the executor with every dispatched item.
    pub item_timeout: Option<Duration>,
    /// Attempts for re-deciding a result that hit a version conflict.
    pub conflict_attempts: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            aging: AgingPolicy::default(),
            item_timeout: None,
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    /// A fatal error stopped dispatching; in-flight items may still finish.
    Halting(ExecutionError),
    /// The operator cancelled the run; in-flight items may still finish.
    Cancelling,
    Finished(RunOutcome),
}

/// An item that ended `Failed`, with the error that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub id: ItemId,
    pub error: ExecutionError,
}

fn is_refusal(err: &PlanError) -> bool {
    matches!(
        err,
        PlanError::InvalidTransition { .. } | PlanError::GuardFailed { .. }
    )
}

/// Scheduler owns the item graph plus everything needed to move items
/// through their lifecycle during one run.
///
/// It is responsible for:
/// - keeping runnable leaves in the ready queue (deps complete, not halted)
/// - dispatching up to `max_concurrency` items at once
/// - recording results through the state machine and the store
/// - re-evaluating only the dependents of what just completed
/// - blocking dependents of failures and cascading cancellations
/// - halting on fatal errors
#[derive(Debug)]
pub struct Scheduler {
    graph: GraphStore,
    resolution: Resolution,
    /// Position of every item in `resolution.order()`.
    position: Vec<usize>,
    store: Box<dyn TransitionStore>,
    machine: StateMachine,
    policy: Box<dyn FatalityPolicy>,
    options: SchedulerOptions,
    queue: ReadyQueue,
    /// In-flight leaves and the version they were dispatched at.
    in_flight: BTreeMap<ItemIdx, u64>,
    awaiting_review: BTreeSet<ItemIdx>,
    phase: RunPhase,
    failures: Vec<FailureRecord>,
    blocked_by: BTreeMap<ItemId, Vec<ItemId>>,
    halt_cause: Option<ExecutionError>,
    persist_warnings: Vec<ExecutionError>,
}

impl Scheduler {
    /// Resolve the graph and apply priority inheritance.
    ///
    /// Fails with `CycleDetected` if the execution relation is cyclic.
    pub fn new(
        mut graph: GraphStore,
        store: Box<dyn TransitionStore>,
        machine: StateMachine,
        policy: Box<dyn FatalityPolicy>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let resolution = DependencyResolver::resolve(&graph)?;
        inherit_priorities(&mut graph, &resolution);

        let mut position = vec![0usize; graph.len()];
        for (pos, idx) in resolution.order().iter().enumerate() {
            position[idx.index()] = pos;
        }

        Ok(Self {
            graph,
            resolution,
            position,
            store,
            machine,
            policy,
            queue: ReadyQueue::new(options.aging),
            options: SchedulerOptions {
                max_concurrency: options.max_concurrency.max(1),
                ..options
            },
            in_flight: BTreeMap::new(),
            awaiting_review: BTreeSet::new(),
            phase: RunPhase::Running,
            failures: Vec::new(),
            blocked_by: BTreeMap::new(),
            halt_cause: None,
            persist_warnings: Vec::new(),
        })
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.phase {
            RunPhase::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, RunPhase::Finished(_))
    }

    fn is_running(&self) -> bool {
        self.phase == RunPhase::Running
    }

    pub fn in_flight_ids(&self) -> Vec<ItemId> {
        self.graph.ids(self.in_flight.keys().copied())
    }

    pub fn awaiting_review_ids(&self) -> Vec<ItemId> {
        self.graph.ids(self.awaiting_review.iter().copied())
    }

    /// Queued ids in the order they would be dispatched at `now`.
    pub fn queued_ids(&self, now: Instant) -> Vec<ItemId> {
        self.queue
            .peek_order(now)
            .into_iter()
            .map(|idx| self.graph.id_of(idx).clone())
            .collect()
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn blocked_chains(&self) -> &BTreeMap<ItemId, Vec<ItemId>> {
        &self.blocked_by
    }

    pub fn halt_cause(&self) -> Option<&ExecutionError> {
        self.halt_cause.as_ref()
    }

    pub fn persist_warnings(&self) -> &[ExecutionError] {
        &self.persist_warnings
    }

    /// Compact the store (end of run).
    pub fn checkpoint(&mut self) -> Result<()> {
        self.store.checkpoint()
    }

    /// Start a fresh session, or resume the stored one.
    ///
    /// Returns recovery stats when a session was resumed. A persistence error
    /// classified as fatal while recording recovery transitions aborts here.
    pub fn open_session(&mut self, resume: bool, retry_failed: bool) -> Result<Option<RecoveryStats>> {
        let loaded = if resume { self.store.load()? } else { None };

        let (stats, persist_errors) = match loaded {
            Some(state) => {
                let (stats, errors) = recover(
                    &mut self.graph,
                    self.store.as_mut(),
                    &self.machine,
                    &state,
                    retry_failed,
                )?;
                (Some(stats), errors)
            }
            None => {
                if resume {
                    warn!("no stored session to resume; starting a fresh one");
                }
                self.store.initialize(&self.graph)?;
                let prop = reaggregate_all(&mut self.graph, self.store.as_mut())?;
                (None, prop.persist_errors)
            }
        };

        for err in persist_errors {
            if self.policy.classify(&err) == Severity::Fatal {
                return Err(err.into());
            }
            warn!(error = %err, "session write failed while opening session");
            self.persist_warnings.push(err);
        }
        Ok(stats)
    }

    fn leaves_in_order(&self) -> Vec<ItemIdx> {
        self.resolution
            .order()
            .iter()
            .copied()
            .filter(|idx| self.graph.is_leaf(*idx))
            .collect()
    }

    fn sort_by_position(&self, handles: &mut [ItemIdx]) {
        handles.sort_by_key(|idx| self.position[idx.index()]);
    }

    fn scheduled_item(&self, idx: ItemIdx, dispatch_version: u64) -> ScheduledItem {
        let item = self.graph.item(idx);
        ScheduledItem {
            id: item.id.clone(),
            dispatch_version,
            title: item.title.clone(),
            command: item.command.clone(),
            priority: item.priority,
            timeout: self.options.item_timeout,
        }
    }

    /// Begin dispatching.
    ///
    /// Leaves whose dependencies already failed (e.g. after a resume without
    /// retry) are blocked first; every runnable leaf is then queued.
    pub fn start(&mut self, now: Instant) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let leaves = self.leaves_in_order();

        info!(
            items = self.graph.len(),
            leaves = leaves.len(),
            levels = self.resolution.levels().len(),
            max_concurrency = self.options.max_concurrency,
            "scheduler: starting run"
        );

        for &idx in &leaves {
            if !self.graph.status_of(idx).is_waiting() {
                continue;
            }
            if let Some(dep) = self.graph.unsatisfiable_dependency(idx) {
                let chain = vec![self.graph.id_of(dep).clone()];
                self.block_leaf(idx, &chain, &mut step)?;
            }
        }

        for &idx in &leaves {
            self.try_enqueue(idx, now, &mut step)?;
        }

        self.fill(now, &mut step)?;
        self.maybe_finish(&mut step);
        Ok(step)
    }

    fn apply(&mut self, req: TransitionRequest, step: &mut SchedulerStep) -> Result<Applied> {
        let applied = self
            .machine
            .apply(&mut self.graph, self.store.as_mut(), req)?;
        if let Some(err) = applied.persist_error.clone() {
            self.on_persist_error(err, step);
        }
        Ok(applied)
    }

    fn on_persist_error(&mut self, err: ExecutionError, step: &mut SchedulerStep) {
        match self.policy.classify(&err) {
            Severity::Fatal => self.halt(err, step),
            Severity::Recoverable => {
                warn!(error = %err, "session write failed; continuing");
                self.persist_warnings.push(err);
            }
        }
    }

    /// Recompute ancestors; returns containers that just became `Complete`.
    fn propagate(&mut self, idx: ItemIdx, step: &mut SchedulerStep) -> Result<Vec<ItemIdx>> {
        let prop = propagate_up(&mut self.graph, self.store.as_mut(), idx)?;
        let completed = prop.completed().collect();
        for err in prop.persist_errors {
            self.on_persist_error(err, step);
        }
        Ok(completed)
    }

    fn halt(&mut self, err: ExecutionError, step: &mut SchedulerStep) {
        if !matches!(self.phase, RunPhase::Running | RunPhase::Cancelling) {
            return;
        }
        error!(
            code = %err.code,
            item = ?err.item.as_ref().map(ItemId::as_str),
            in_flight = self.in_flight.len(),
            error = %err.message,
            "scheduler: fatal error; halting dispatch"
        );
        self.queue.clear();
        self.phase = RunPhase::Halting(err.clone());
        self.halt_cause = Some(err.clone());
        step.halted = Some(err);
    }

    /// Queue `idx` if it is a runnable leaf. `Planned` leaves move to `Queued`.
    fn try_enqueue(&mut self, idx: ItemIdx, now: Instant, step: &mut SchedulerStep) -> Result<bool> {
        if !self.is_running()
            || !self.graph.is_leaf(idx)
            || self.queue.contains(idx)
            || self.in_flight.contains_key(&idx)
        {
            return Ok(false);
        }

        match self.graph.status_of(idx) {
            Status::Planned => {
                if !self.graph.dependencies_complete(idx) {
                    return Ok(false);
                }
                let req = TransitionRequest::current(&self.graph, idx, Status::Queued, Actor::Scheduler);
                match self.apply(req, step) {
                    Ok(_) => {}
                    Err(e) if is_refusal(&e) => {
                        self.on_refused(idx, e, step)?;
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
                self.propagate(idx, step)?;
            }
            Status::Queued => {
                if !self.graph.dependencies_complete(idx) {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }

        let priority = self.graph.item(idx).priority;
        self.queue.push(idx, priority, now);
        debug!(item = %self.graph.id_of(idx), priority, "scheduler: item ready");
        Ok(true)
    }

    /// Dispatch from the queue until the concurrency bound is reached.
    fn fill(&mut self, now: Instant, step: &mut SchedulerStep) -> Result<()> {
        while self.is_running() && self.in_flight.len() < self.options.max_concurrency {
            let Some(idx) = self.queue.pop(now) else {
                break;
            };
            if self.graph.status_of(idx) != Status::Queued {
                debug!(item = %self.graph.id_of(idx), "queued item changed status; skipping");
                continue;
            }

            let req = TransitionRequest::current(&self.graph, idx, Status::InProgress, Actor::Scheduler);
            let applied = match self.apply(req, step) {
                Ok(applied) => applied,
                Err(e) if is_refusal(&e) => {
                    self.on_refused(idx, e, step)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.in_flight.insert(idx, applied.version);
            self.propagate(idx, step)?;
            let scheduled = self.scheduled_item(idx, applied.version);
            info!(
                item = %scheduled.id,
                version = scheduled.dispatch_version,
                priority = scheduled.priority,
                in_flight = self.in_flight.len(),
                "scheduler: dispatching item"
            );
            step.dispatched.push(scheduled);
        }
        Ok(())
    }

    fn maybe_finish(&mut self, step: &mut SchedulerStep) {
        let outcome = match &self.phase {
            RunPhase::Running
                if self.in_flight.is_empty()
                    && self.queue.is_empty()
                    && self.awaiting_review.is_empty() =>
            {
                let all_complete = self
                    .graph
                    .indices()
                    .filter(|idx| self.graph.is_leaf(*idx))
                    .all(|idx| self.graph.status_of(idx) == Status::Complete);
                if all_complete {
                    RunOutcome::Completed
                } else {
                    RunOutcome::PartialSuccess
                }
            }
            RunPhase::Halting(_) if self.in_flight.is_empty() => RunOutcome::Halted,
            RunPhase::Cancelling if self.in_flight.is_empty() => RunOutcome::Cancelled,
            _ => return,
        };

        info!(outcome = %outcome, failed = self.failures.len(), "scheduler: run finished");
        self.phase = RunPhase::Finished(outcome);
        step.finished = Some(outcome);
    }

    /// Record the executor's result for a dispatched item.
    ///
    /// `dispatch_version` must be the version the item was dispatched at. A
    /// result for a dispatch that is no longer current (the item was
    /// cancelled, aborted or already finished) is discarded.
    pub fn complete(
        &mut self,
        id: &ItemId,
        dispatch_version: u64,
        outcome: ItemOutcome,
        now: Instant,
    ) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let Ok(idx) = self.graph.index_of(id) else {
            warn!(item = %id, "result for unknown item; ignoring");
            return Ok(step);
        };

        let target = match &outcome {
            ItemOutcome::Success => Status::Complete,
            ItemOutcome::NeedsReview => Status::AwaitingReview,
            ItemOutcome::Failed(_) => Status::Failed,
        };

        let decision = with_conflict_retry(self.options.conflict_attempts, |attempt| {
            let expected = if attempt == 1 {
                dispatch_version
            } else {
                let current = self.graph.item(idx);
                if current.status != Status::InProgress
                    || self.in_flight.get(&idx) != Some(&dispatch_version)
                {
                    return Ok(None);
                }
                current.version
            };
            let mut req = TransitionRequest::new(idx, target, expected, Actor::Executor);
            if let ItemOutcome::Failed(err) = &outcome {
                req = req.with_error(err);
            }
            self.machine
                .apply(&mut self.graph, self.store.as_mut(), req)
                .map(Some)
        });

        let applied = match decision {
            Ok(Some(applied)) => applied,
            Ok(None) => {
                debug!(item = %id, dispatch_version, "stale result discarded");
                return Ok(step);
            }
            Err(e) if is_refusal(&e) => {
                self.in_flight.remove(&idx);
                self.on_refused(idx, e, &mut step)?;
                self.fill(now, &mut step)?;
                self.maybe_finish(&mut step);
                return Ok(step);
            }
            Err(e) if e.is_version_conflict() => {
                warn!(item = %id, dispatch_version, error = %e, "result not applied");
                return Ok(step);
            }
            Err(e) => return Err(e),
        };
        if let Some(err) = applied.persist_error {
            self.on_persist_error(err, &mut step);
        }
        self.in_flight.remove(&idx);

        match outcome {
            ItemOutcome::Success => {
                info!(item = %id, "scheduler: item complete");
                self.on_completed(idx, now, &mut step)?;
            }
            ItemOutcome::NeedsReview => {
                info!(item = %id, "scheduler: item awaiting review");
                self.awaiting_review.insert(idx);
                self.propagate(idx, &mut step)?;
            }
            ItemOutcome::Failed(err) => self.on_failed(idx, err, &mut step)?,
        }

        self.fill(now, &mut step)?;
        self.maybe_finish(&mut step);
        Ok(step)
    }

    fn on_completed(&mut self, idx: ItemIdx, now: Instant, step: &mut SchedulerStep) -> Result<()> {
        step.newly_completed.push(self.graph.id_of(idx).clone());
        let mut sources = vec![idx];
        sources.extend(self.propagate(idx, step)?);

        // Only dependents of what just completed can have become runnable.
        let mut candidates: BTreeSet<ItemIdx> = BTreeSet::new();
        for source in sources {
            for &dependent in self.graph.dependents(source) {
                candidates.extend(self.graph.leaves_under(dependent));
            }
        }
        let mut candidates: Vec<ItemIdx> = candidates.into_iter().collect();
        self.sort_by_position(&mut candidates);

        for candidate in candidates {
            self.try_enqueue(candidate, now, step)?;
        }
        Ok(())
    }

    fn on_failed(&mut self, idx: ItemIdx, err: ExecutionError, step: &mut SchedulerStep) -> Result<()> {
        let id = self.graph.id_of(idx).clone();
        let err = if err.item.is_none() { err.for_item(&id) } else { err };

        step.newly_failed.push(id.clone());
        self.failures.push(FailureRecord {
            id: id.clone(),
            error: err.clone(),
        });
        self.propagate(idx, step)?;

        match self.policy.classify(&err) {
            Severity::Fatal => self.halt(err, step),
            Severity::Recoverable => {
                warn!(item = %id, code = %err.code, error = %err.message, "scheduler: item failed; blocking dependents");
            }
        }
        self.block_dependents(idx, step)
    }

    /// A transition refused mid-run fails the item with `INVALID_TRANSITION`
    /// and blocks its dependents. Returns `false` when the item has no route
    /// to `Failed` and is left as it is.
    fn on_refused(&mut self, idx: ItemIdx, refusal: PlanError, step: &mut SchedulerStep) -> Result<bool> {
        let id = self.graph.id_of(idx).clone();
        let mut err =
            ExecutionError::new(ErrorCode::InvalidTransition, refusal.to_string()).for_item(&id);
        if let PlanError::GuardFailed { guard, .. } = &refusal {
            err = err.with_context("guard", guard);
        }

        let applied = self
            .machine
            .fail_refused(&mut self.graph, self.store.as_mut(), idx, &err)?;
        if applied.is_empty() {
            warn!(
                item = %id,
                status = %self.graph.status_of(idx),
                error = %refusal,
                "scheduler: transition refused; item left as is"
            );
            return Ok(false);
        }
        for persist_error in applied.into_iter().filter_map(|a| a.persist_error) {
            self.on_persist_error(persist_error, step);
        }

        warn!(item = %id, error = %refusal, "scheduler: transition refused; failing item");
        self.queue.remove(idx);
        self.awaiting_review.remove(&idx);
        self.on_failed(idx, err, step)?;
        Ok(true)
    }

    /// Block every waiting leaf that transitively depends on `source`.
    fn block_dependents(&mut self, source: ItemIdx, step: &mut SchedulerStep) -> Result<()> {
        let mut visited: HashSet<ItemIdx> = HashSet::from([source]);
        let mut frontier: VecDeque<(ItemIdx, Vec<ItemId>)> =
            VecDeque::from([(source, vec![self.graph.id_of(source).clone()])]);

        while let Some((node, chain)) = frontier.pop_front() {
            if !self.graph.status_of(node).is_unsatisfiable() {
                continue;
            }
            let mut dependents = self.graph.execution_dependents(node);
            self.sort_by_position(&mut dependents);

            for dependent in dependents {
                if !visited.insert(dependent) {
                    continue;
                }
                if self.graph.is_leaf(dependent) && self.graph.status_of(dependent).is_waiting() {
                    self.block_leaf(dependent, &chain, step)?;
                }
                let mut next = chain.clone();
                next.push(self.graph.id_of(dependent).clone());
                frontier.push_back((dependent, next));
            }
        }
        Ok(())
    }

    fn block_leaf(&mut self, idx: ItemIdx, chain: &[ItemId], step: &mut SchedulerStep) -> Result<()> {
        let rendered = chain
            .iter()
            .map(ItemId::as_str)
            .collect::<Vec<_>>()
            .join(" -> ");
        let req = TransitionRequest::current(&self.graph, idx, Status::Blocked, Actor::Scheduler)
            .with_context("blocked_by", &rendered);
        match self.apply(req, step) {
            Ok(_) => {}
            Err(e) if is_refusal(&e) => {
                self.on_refused(idx, e, step)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let id = self.graph.id_of(idx).clone();
        info!(item = %id, blocked_by = %rendered, "scheduler: item blocked");
        self.queue.remove(idx);
        self.blocked_by.insert(id.clone(), chain.to_vec());
        step.newly_blocked.push(id);
        self.propagate(idx, step)?;
        Ok(())
    }

    /// Cancel an item (every non-terminal leaf under it if it is a container)
    /// and everything that transitively depends on it. In-flight targets are
    /// reported in `aborted`.
    pub fn cancel_item(&mut self, id: &ItemId, now: Instant) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let Ok(root) = self.graph.index_of(id) else {
            warn!(item = %id, "cancel for unknown item; ignoring");
            return Ok(step);
        };

        let mut seeds = vec![root];
        seeds.extend(self.graph.descendants(root));
        let mut visited: HashSet<ItemIdx> = seeds.iter().copied().collect();
        let mut frontier: VecDeque<ItemIdx> = seeds.iter().copied().collect();
        let mut targets: Vec<ItemIdx> = seeds
            .iter()
            .copied()
            .filter(|idx| self.graph.is_leaf(*idx))
            .collect();

        while let Some(node) = frontier.pop_front() {
            for dependent in self.graph.execution_dependents(node) {
                // Ancestors of the root aggregate the cancellation; they are
                // walked for their dependents but their other children stay.
                if visited.insert(dependent) {
                    if self.graph.is_leaf(dependent) {
                        targets.push(dependent);
                    }
                    frontier.push_back(dependent);
                }
            }
        }
        self.sort_by_position(&mut targets);

        info!(item = %id, targets = targets.len(), "scheduler: cancelling item and dependents");

        for idx in targets {
            let status = self.graph.status_of(idx);
            if status.is_terminal() && status != Status::Blocked {
                continue;
            }
            let item_id = self.graph.id_of(idx).clone();
            let req = TransitionRequest::current(&self.graph, idx, Status::Cancelled, Actor::Operator)
                .with_context("cancelled_by", id);
            match self.apply(req, &mut step) {
                Ok(_) => {}
                Err(e) if is_refusal(&e) => {
                    if self.on_refused(idx, e, &mut step)? && self.in_flight.remove(&idx).is_some() {
                        step.aborted.push(item_id);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.in_flight.remove(&idx).is_some() {
                step.aborted.push(item_id.clone());
            }
            self.awaiting_review.remove(&idx);
            self.queue.remove(idx);
            step.newly_cancelled.push(item_id);
            self.propagate(idx, &mut step)?;
        }

        self.fill(now, &mut step)?;
        self.maybe_finish(&mut step);
        Ok(step)
    }

    /// Stop dispatching; in-flight items finish, then the run ends `Cancelled`.
    pub fn cancel_run(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.is_running() {
            info!(in_flight = self.in_flight.len(), "scheduler: run cancelled");
            self.queue.clear();
            self.phase = RunPhase::Cancelling;
        }
        self.maybe_finish(&mut step);
        step
    }

    /// Approve or reject an item waiting in `AwaitingReview`.
    pub fn resolve_review(&mut self, id: &ItemId, approved: bool, now: Instant) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let idx = match self.graph.index_of(id) {
            Ok(idx) if self.awaiting_review.contains(&idx) => idx,
            _ => {
                warn!(item = %id, "review for an item that is not awaiting review; ignoring");
                return Ok(step);
            }
        };
        self.awaiting_review.remove(&idx);

        if approved {
            let req = TransitionRequest::current(&self.graph, idx, Status::Complete, Actor::Operator)
                .with_context("review", "approved");
            match self.apply(req, &mut step) {
                Ok(_) => {
                    info!(item = %id, "scheduler: review approved");
                    self.on_completed(idx, now, &mut step)?;
                }
                Err(e) if is_refusal(&e) => {
                    self.on_refused(idx, e, &mut step)?;
                }
                Err(e) => return Err(e),
            }
        } else {
            let err = ExecutionError::new(ErrorCode::TaskValidationFailed, "review rejected")
                .for_item(id);
            let req = TransitionRequest::current(&self.graph, idx, Status::Failed, Actor::Operator)
                .with_error(&err);
            match self.apply(req, &mut step) {
                Ok(_) => self.on_failed(idx, err, &mut step)?,
                Err(e) if is_refusal(&e) => {
                    self.on_refused(idx, e, &mut step)?;
                }
                Err(e) => return Err(e),
            }
        }

        self.fill(now, &mut step)?;
        self.maybe_finish(&mut step);
        Ok(step)
    }

    /// The fatal-halt grace period is over: abort everything still running.
    pub fn grace_elapsed(&mut self) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        if !matches!(self.phase, RunPhase::Halting(_)) {
            return Ok(step);
        }

        let running: Vec<ItemIdx> = self.in_flight.keys().copied().collect();
        for idx in running {
            let id = self.graph.id_of(idx).clone();
            let err = ExecutionError::timeout("grace period elapsed").for_item(&id);
            let req = TransitionRequest::current(&self.graph, idx, Status::Failed, Actor::Scheduler)
                .with_error(&err);
            match self.apply(req, &mut step) {
                Ok(_) => {}
                Err(e) if is_refusal(&e) => {
                    let applied =
                        self.machine
                            .fail_refused(&mut self.graph, self.store.as_mut(), idx, &err)?;
                    for persist_error in applied.into_iter().filter_map(|a| a.persist_error) {
                        self.on_persist_error(persist_error, &mut step);
                    }
                }
                Err(e) => return Err(e),
            }
            warn!(item = %id, "scheduler: aborting in-flight item after grace period");

            self.in_flight.remove(&idx);
            self.failures.push(FailureRecord {
                id: id.clone(),
                error: err,
            });
            step.aborted.push(id.clone());
            step.newly_failed.push(id);
            self.propagate(idx, &mut step)?;
        }

        self.maybe_finish(&mut step);
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Item, StoryPoints};
    use crate::persist::MemoryStore;
    use crate::state::CodePolicy;

    fn id(s: &str) -> ItemId {
        s.parse().unwrap()
    }

    fn item(s: &str, deps: &[&str]) -> Item {
        let mut it = Item::new(id(s)).with_dependencies(deps.iter().map(|d| id(d)));
        if s.contains(".S") {
            it.story_points = Some(StoryPoints::try_from(1).unwrap());
        }
        it
    }

    fn scheduler(items: Vec<Item>, max_concurrency: usize) -> Scheduler {
        let graph = GraphStore::from_items(items).unwrap();
        let mut sched = Scheduler::new(
            graph,
            Box::new(MemoryStore::new()),
            StateMachine::new(),
            Box::new(CodePolicy::default()),
            SchedulerOptions {
                max_concurrency,
                aging: AgingPolicy::disabled(),
                ..SchedulerOptions::default()
            },
        )
        .unwrap();
        sched.open_session(false, false).unwrap();
        sched
    }

    #[test]
    fn dispatch_respects_concurrency_and_dependencies() {
        let now = Instant::now();
        let mut s = scheduler(
            vec![item("P1", &[]), item("P2", &[]), item("P3", &[]), item("P4", &["P1"])],
            2,
        );

        let step = s.start(now).unwrap();
        assert_eq!(step.dispatched_ids(), vec![id("P1"), id("P2")]);
        assert_eq!(s.queued_ids(now), vec![id("P3")]);

        let v = step.dispatched[0].dispatch_version;
        let step = s.complete(&id("P1"), v, ItemOutcome::Success, now).unwrap();
        // P3 was queued first; P4 only became ready now.
        assert_eq!(step.dispatched_ids(), vec![id("P3")]);
        assert_eq!(s.queued_ids(now), vec![id("P4")]);
    }

    #[test]
    fn duplicate_result_is_not_applied_twice() {
        let now = Instant::now();
        let mut s = scheduler(vec![item("P1", &[]), item("P2", &["P1"])], 1);
        let step = s.start(now).unwrap();
        let v = step.dispatched[0].dispatch_version;

        s.complete(&id("P1"), v, ItemOutcome::Success, now).unwrap();
        let version_after = s.graph().get("P1").unwrap().version;
        let again = s.complete(&id("P1"), v, ItemOutcome::Success, now).unwrap();

        assert!(again.dispatched.is_empty());
        assert!(again.newly_completed.is_empty());
        assert_eq!(s.graph().get("P1").unwrap().version, version_after);
    }

    #[test]
    fn review_gate_holds_dependents() {
        let now = Instant::now();
        let mut s = scheduler(vec![item("P1", &[]), item("P2", &["P1"])], 1);
        let v = s.start(now).unwrap().dispatched[0].dispatch_version;

        let step = s.complete(&id("P1"), v, ItemOutcome::NeedsReview, now).unwrap();
        assert!(step.dispatched.is_empty());
        assert!(step.finished.is_none());
        assert_eq!(s.awaiting_review_ids(), vec![id("P1")]);

        let step = s.resolve_review(&id("P1"), true, now).unwrap();
        assert_eq!(step.dispatched_ids(), vec![id("P2")]);
    }

    #[test]
    fn rejected_review_blocks_dependents() {
        let now = Instant::now();
        let mut s = scheduler(vec![item("P1", &[]), item("P2", &["P1"])], 1);
        let v = s.start(now).unwrap().dispatched[0].dispatch_version;
        s.complete(&id("P1"), v, ItemOutcome::NeedsReview, now).unwrap();

        let step = s.resolve_review(&id("P1"), false, now).unwrap();
        assert_eq!(step.newly_failed, vec![id("P1")]);
        assert_eq!(step.newly_blocked, vec![id("P2")]);
        assert_eq!(step.finished, Some(RunOutcome::PartialSuccess));
    }

    #[test]
    fn cancelling_a_container_cancels_leaves_and_dependents() {
        let now = Instant::now();
        let mut s = scheduler(
            vec![
                item("P1", &[]),
                item("P1.M1", &[]),
                item("P1.M2", &[]),
                item("P2", &["P1"]),
                item("P3", &[]),
            ],
            1,
        );
        let step = s.start(now).unwrap();
        assert_eq!(step.dispatched_ids(), vec![id("P1.M1")]);

        let step = s.cancel_item(&id("P1"), now).unwrap();
        assert_eq!(step.aborted, vec![id("P1.M1")]);
        assert!(step.newly_cancelled.contains(&id("P1.M2")));
        assert!(step.newly_cancelled.contains(&id("P2")));
        assert_eq!(step.dispatched_ids(), vec![id("P3")]);
        assert_eq!(s.graph().get("P1").unwrap().status, Status::Cancelled);
    }

    #[test]
    fn run_cancellation_waits_for_in_flight() {
        let now = Instant::now();
        let mut s = scheduler(vec![item("P1", &[]), item("P2", &[])], 1);
        let v = s.start(now).unwrap().dispatched[0].dispatch_version;

        let step = s.cancel_run();
        assert!(step.finished.is_none());
        let step = s.complete(&id("P1"), v, ItemOutcome::Success, now).unwrap();
        assert!(step.dispatched.is_empty());
        assert_eq!(step.finished, Some(RunOutcome::Cancelled));
        assert_eq!(s.graph().get("P2").unwrap().status, Status::Queued);
    }
}
