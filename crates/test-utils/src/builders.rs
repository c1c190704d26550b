#![allow(dead_code)]

use plandag::dag::{
    AgingPolicy, GraphStore, Item, ItemId, Scheduler, SchedulerOptions, StoryPoints,
};
use plandag::persist::{MemoryStore, TransitionStore};
use plandag::state::{CodePolicy, StateMachine};
use plandag::types::{ItemLevel, Status};

pub fn id(s: &str) -> ItemId {
    s.parse().unwrap_or_else(|e| panic!("bad test id {s:?}: {e}"))
}

/// Builder for a single `Item`.
///
/// Subtasks get one story point unless `points` is called.
pub struct ItemBuilder {
    item: Item,
}

impl ItemBuilder {
    pub fn new(item_id: &str) -> Self {
        Self {
            item: Item::new(id(item_id)),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.item.dependencies.push(id(dep));
        self
    }

    pub fn soft_after(mut self, dep: &str) -> Self {
        self.item.soft_dependencies.push(id(dep));
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.item = self.item.with_priority(priority);
        self
    }

    pub fn points(mut self, points: u32) -> Self {
        self.item.story_points = Some(StoryPoints::try_from(points).expect("admissible points"));
        self
    }

    pub fn command(mut self, cmd: &str) -> Self {
        self.item.command = Some(cmd.to_string());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.item.status = status;
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.item.title = title.to_string();
        self
    }

    pub fn build(mut self) -> Item {
        if self.item.level() == ItemLevel::Subtask && self.item.story_points.is_none() {
            self.item.story_points = StoryPoints::try_from(1).ok();
        }
        self.item
    }
}

/// Builder for a whole plan.
#[derive(Default)]
pub struct PlanBuilder {
    items: Vec<Item>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(mut self, item: ItemBuilder) -> Self {
        self.items.push(item.build());
        self
    }

    /// Shorthand for an item with hard dependencies only.
    pub fn with(self, item_id: &str, deps: &[&str]) -> Self {
        let builder = deps
            .iter()
            .fold(ItemBuilder::new(item_id), |b, dep| b.after(dep));
        self.item(builder)
    }

    pub fn items(self) -> Vec<Item> {
        self.items
    }

    pub fn graph(self) -> GraphStore {
        GraphStore::from_items(self.items).expect("Failed to build valid graph from builder")
    }
}

/// Scheduler options for deterministic tests: no aging.
pub fn test_options(max_concurrency: usize) -> SchedulerOptions {
    SchedulerOptions {
        max_concurrency,
        aging: AgingPolicy::disabled(),
        ..SchedulerOptions::default()
    }
}

/// Scheduler on a fresh in-memory session.
pub fn memory_scheduler(graph: GraphStore, policy: CodePolicy, max_concurrency: usize) -> Scheduler {
    scheduler_with_store(graph, Box::new(MemoryStore::new()), policy, max_concurrency)
}

/// Scheduler on a fresh session in `store`.
pub fn scheduler_with_store(
    graph: GraphStore,
    store: Box<dyn TransitionStore>,
    policy: CodePolicy,
    max_concurrency: usize,
) -> Scheduler {
    build_scheduler(graph, store, StateMachine::new(), policy, max_concurrency)
}

/// In-memory scheduler whose state machine carries extra guards.
pub fn scheduler_with_machine(
    graph: GraphStore,
    machine: StateMachine,
    max_concurrency: usize,
) -> Scheduler {
    build_scheduler(
        graph,
        Box::new(MemoryStore::new()),
        machine,
        CodePolicy::default(),
        max_concurrency,
    )
}

fn build_scheduler(
    graph: GraphStore,
    store: Box<dyn TransitionStore>,
    machine: StateMachine,
    policy: CodePolicy,
    max_concurrency: usize,
) -> Scheduler {
    let mut scheduler = Scheduler::new(
        graph,
        store,
        machine,
        Box::new(policy),
        test_options(max_concurrency),
    )
    .expect("Failed to build scheduler");
    scheduler
        .open_session(false, false)
        .expect("Failed to open session");
    scheduler
}
