// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::item::{Item, ItemId, ItemIdx};
use crate::errors::{PlanError, Result};
use crate::types::{ItemLevel, Status};

/// Arena of plan items plus dependency, reverse-dependency and containment
/// indexes.
///
/// Items are addressed by [`ItemIdx`] handles that stay valid for the
/// lifetime of the store (items are never removed). The reverse index
/// (`dependents`) is maintained on every edge mutation so lookups are O(1).
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    items: Vec<Item>,
    index: HashMap<ItemId, ItemIdx>,
    deps: Vec<Vec<ItemIdx>>,
    soft_deps: Vec<Vec<ItemIdx>>,
    dependents: Vec<BTreeSet<ItemIdx>>,
    soft_dependents: Vec<BTreeSet<ItemIdx>>,
    parent: Vec<Option<ItemIdx>>,
    children: Vec<Vec<ItemIdx>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single item whose parent and dependencies are already present.
    pub fn add_item(&mut self, item: Item) -> Result<ItemIdx> {
        item.validate()?;
        if self.index.contains_key(&item.id) {
            return Err(PlanError::DuplicateId(item.id));
        }

        let parent = match item.id.parent() {
            Some(pid) => Some(self.index_of(&pid).map_err(|_| {
                PlanError::InvalidItem(format!(
                    "item '{}' has no parent '{}' in the graph",
                    item.id, pid
                ))
            })?),
            None => None,
        };

        let deps = self.resolve_ids(&item.id, &item.dependencies)?;
        let soft = self.resolve_ids(&item.id, &item.soft_dependencies)?;

        let idx = self.push_node(item);
        self.attach(idx, parent, deps, soft);
        Ok(idx)
    }

    /// Build a store from a complete set of items in any order.
    ///
    /// Dependencies and parents are resolved after every item is inserted, so
    /// forward references are fine. Acyclicity is not checked here; the
    /// resolver does that.
    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Result<Self> {
        let mut store = GraphStore::new();

        for item in items {
            item.validate()?;
            if store.index.contains_key(&item.id) {
                return Err(PlanError::DuplicateId(item.id));
            }
            store.push_node(item);
        }

        for pos in 0..store.items.len() {
            let idx = ItemIdx(pos as u32);
            let item = &store.items[pos];

            let parent = match item.id.parent() {
                Some(pid) => Some(*store.index.get(&pid).ok_or_else(|| {
                    PlanError::InvalidItem(format!(
                        "item '{}' has no parent '{}' in the graph",
                        item.id, pid
                    ))
                })?),
                None => None,
            };
            let deps = store.resolve_ids(&item.id, &item.dependencies)?;
            let soft = store.resolve_ids(&item.id, &item.soft_dependencies)?;

            store.attach(idx, parent, deps, soft);
        }

        debug!(items = store.items.len(), "graph store built");
        Ok(store)
    }

    fn push_node(&mut self, item: Item) -> ItemIdx {
        let idx = ItemIdx(self.items.len() as u32);
        self.index.insert(item.id.clone(), idx);
        self.items.push(item);
        self.deps.push(Vec::new());
        self.soft_deps.push(Vec::new());
        self.dependents.push(BTreeSet::new());
        self.soft_dependents.push(BTreeSet::new());
        self.parent.push(None);
        self.children.push(Vec::new());
        idx
    }

    fn attach(
        &mut self,
        idx: ItemIdx,
        parent: Option<ItemIdx>,
        deps: Vec<ItemIdx>,
        soft: Vec<ItemIdx>,
    ) {
        for dep in &deps {
            self.dependents[dep.index()].insert(idx);
        }
        for dep in &soft {
            self.soft_dependents[dep.index()].insert(idx);
        }
        if let Some(p) = parent {
            let siblings = &mut self.children[p.index()];
            siblings.push(idx);
            let items = &self.items;
            siblings.sort_by(|a, b| items[a.index()].id.cmp(&items[b.index()].id));
        }
        self.parent[idx.index()] = parent;
        self.deps[idx.index()] = deps;
        self.soft_deps[idx.index()] = soft;
    }

    fn resolve_ids(&self, owner: &ItemId, ids: &[ItemId]) -> Result<Vec<ItemIdx>> {
        ids.iter()
            .map(|dep| {
                self.index
                    .get(dep)
                    .copied()
                    .ok_or_else(|| PlanError::UnresolvedDependency {
                        item: owner.clone(),
                        dependency: dep.to_string(),
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = ItemIdx> + '_ {
        (0..self.items.len()).map(|i| ItemIdx(i as u32))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemIdx, &Item)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (ItemIdx(i as u32), item))
    }

    /// All handles, ordered by ascending item id.
    pub fn sorted_indices(&self) -> Vec<ItemIdx> {
        let mut all: Vec<ItemIdx> = self.indices().collect();
        self.sort_by_id(&mut all);
        all
    }

    pub fn sort_by_id(&self, handles: &mut [ItemIdx]) {
        handles.sort_by(|a, b| self.item(*a).id.cmp(&self.item(*b).id));
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.index.contains_key(id)
    }

    pub fn index_of(&self, id: &ItemId) -> Result<ItemIdx> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| PlanError::NotFound(id.to_string()))
    }

    /// Look up an item by its string id.
    pub fn get(&self, id: &str) -> Result<&Item> {
        let parsed: ItemId = id.parse().map_err(|_| PlanError::NotFound(id.to_string()))?;
        let idx = self.index_of(&parsed)?;
        Ok(self.item(idx))
    }

    /// Handles are only minted by this store, so indexing cannot go out of
    /// bounds for a handle obtained from it.
    pub fn item(&self, idx: ItemIdx) -> &Item {
        &self.items[idx.index()]
    }

    pub fn id_of(&self, idx: ItemIdx) -> &ItemId {
        &self.items[idx.index()].id
    }

    pub fn status_of(&self, idx: ItemIdx) -> Status {
        self.items[idx.index()].status
    }

    pub fn dependencies(&self, idx: ItemIdx) -> &[ItemIdx] {
        &self.deps[idx.index()]
    }

    pub fn soft_dependencies(&self, idx: ItemIdx) -> &[ItemIdx] {
        &self.soft_deps[idx.index()]
    }

    /// Items that list `idx` as a hard dependency.
    pub fn dependents(&self, idx: ItemIdx) -> &BTreeSet<ItemIdx> {
        &self.dependents[idx.index()]
    }

    pub fn soft_dependents(&self, idx: ItemIdx) -> &BTreeSet<ItemIdx> {
        &self.soft_dependents[idx.index()]
    }

    pub fn parent(&self, idx: ItemIdx) -> Option<ItemIdx> {
        self.parent[idx.index()]
    }

    pub fn children(&self, idx: ItemIdx) -> &[ItemIdx] {
        &self.children[idx.index()]
    }

    /// Leaves are the only executable items; containers aggregate.
    pub fn is_leaf(&self, idx: ItemIdx) -> bool {
        self.children[idx.index()].is_empty()
    }

    /// Parent, grandparent, ... up to the phase. At most three entries.
    pub fn ancestors(&self, idx: ItemIdx) -> Vec<ItemIdx> {
        let mut out = Vec::with_capacity(3);
        let mut cur = self.parent(idx);
        while let Some(p) = cur {
            out.push(p);
            cur = self.parent(p);
        }
        out
    }

    /// Every item contained (transitively) in `idx`, excluding `idx`.
    pub fn descendants(&self, idx: ItemIdx) -> Vec<ItemIdx> {
        let mut out = Vec::new();
        let mut stack: Vec<ItemIdx> = self.children(idx).to_vec();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().copied());
        }
        out
    }

    /// Executable items under `idx` (or `idx` itself if it is a leaf).
    pub fn leaves_under(&self, idx: ItemIdx) -> Vec<ItemIdx> {
        if self.is_leaf(idx) {
            return vec![idx];
        }
        let mut leaves: Vec<ItemIdx> = self
            .descendants(idx)
            .into_iter()
            .filter(|n| self.is_leaf(*n))
            .collect();
        self.sort_by_id(&mut leaves);
        leaves
    }

    /// Items that must be `Complete` before `idx` may complete or run:
    /// its own hard dependencies, those inherited from its ancestors, and
    /// (for containers) its children.
    pub fn execution_dependencies(&self, idx: ItemIdx) -> Vec<ItemIdx> {
        let mut set: BTreeSet<ItemIdx> = self.dependencies(idx).iter().copied().collect();
        for anc in self.ancestors(idx) {
            set.extend(self.dependencies(anc).iter().copied());
        }
        set.extend(self.children(idx).iter().copied());
        let mut out: Vec<ItemIdx> = set.into_iter().collect();
        self.sort_by_id(&mut out);
        out
    }

    /// Reverse of [`GraphStore::execution_dependencies`].
    pub fn execution_dependents(&self, idx: ItemIdx) -> Vec<ItemIdx> {
        let mut set: BTreeSet<ItemIdx> = BTreeSet::new();
        for &d in self.dependents(idx) {
            set.insert(d);
            set.extend(self.descendants(d));
        }
        if let Some(p) = self.parent(idx) {
            set.insert(p);
        }
        let mut out: Vec<ItemIdx> = set.into_iter().collect();
        self.sort_by_id(&mut out);
        out
    }

    /// Whether every execution dependency of `idx` is `Complete`.
    pub fn dependencies_complete(&self, idx: ItemIdx) -> bool {
        self.execution_dependencies(idx)
            .into_iter()
            .all(|d| self.status_of(d) == Status::Complete)
    }

    /// First execution dependency that can no longer complete, if any.
    pub fn unsatisfiable_dependency(&self, idx: ItemIdx) -> Option<ItemIdx> {
        self.execution_dependencies(idx)
            .into_iter()
            .find(|d| self.status_of(*d).is_unsatisfiable())
    }

    /// Set the status of `idx` if its version still equals `expected_version`.
    ///
    /// Status and version change together; returns the new version.
    pub fn update_status(
        &mut self,
        idx: ItemIdx,
        new_status: Status,
        expected_version: u64,
    ) -> Result<u64> {
        let item = &mut self.items[idx.index()];
        if item.version != expected_version {
            return Err(PlanError::VersionConflict {
                item: item.id.clone(),
                expected: expected_version,
                actual: item.version,
            });
        }
        item.status = new_status;
        item.version += 1;
        Ok(item.version)
    }

    /// Overwrite status and version with persisted values when resuming.
    pub fn restore(&mut self, idx: ItemIdx, status: Status, version: u64) {
        let item = &mut self.items[idx.index()];
        item.status = status;
        item.version = version;
    }

    /// Raise the effective priority of `idx` to at least `priority`.
    pub fn raise_priority(&mut self, idx: ItemIdx, priority: u32) -> bool {
        let item = &mut self.items[idx.index()];
        if priority > item.priority {
            item.priority = priority;
            true
        } else {
            false
        }
    }

    /// Drop inherited priority back to the authored value for every item.
    pub fn reset_priorities(&mut self) {
        for item in &mut self.items {
            item.priority = item.base_priority;
        }
    }

    /// Add a hard dependency edge `item -> dependency`.
    pub fn add_dependency(&mut self, item: &ItemId, dependency: &ItemId) -> Result<()> {
        let idx = self.index_of(item)?;
        let dep = self
            .index
            .get(dependency)
            .copied()
            .ok_or_else(|| PlanError::UnresolvedDependency {
                item: item.clone(),
                dependency: dependency.to_string(),
            })?;
        if idx == dep {
            return Err(PlanError::InvalidItem(format!(
                "item '{item}' cannot depend on itself"
            )));
        }
        if self.deps[idx.index()].contains(&dep) {
            return Ok(());
        }
        self.deps[idx.index()].push(dep);
        self.items[idx.index()].dependencies.push(dependency.clone());
        self.dependents[dep.index()].insert(idx);
        Ok(())
    }

    /// Remove a hard dependency edge; returns whether it existed.
    pub fn remove_dependency(&mut self, item: &ItemId, dependency: &ItemId) -> Result<bool> {
        let idx = self.index_of(item)?;
        let dep = self.index_of(dependency)?;
        let before = self.deps[idx.index()].len();
        self.deps[idx.index()].retain(|d| *d != dep);
        self.items[idx.index()]
            .dependencies
            .retain(|d| d != dependency);
        self.dependents[dep.index()].remove(&idx);
        Ok(before != self.deps[idx.index()].len())
    }

    /// Item count per hierarchy level.
    pub fn count_by_level(&self) -> HashMap<ItemLevel, usize> {
        let mut counts = HashMap::new();
        for item in &self.items {
            *counts.entry(item.level()).or_insert(0) += 1;
        }
        counts
    }

    /// Owned copies of all items, sorted by id (used for snapshots).
    pub fn snapshot_items(&self) -> Vec<Item> {
        self.sorted_indices()
            .into_iter()
            .map(|idx| self.item(idx).clone())
            .collect()
    }

    /// Explicit hard-dependency relation as a petgraph view (edge `dep -> item`).
    pub fn to_petgraph(&self) -> DiGraphMap<&str, ()> {
        let mut graph = DiGraphMap::new();
        for item in &self.items {
            graph.add_node(item.id.as_str());
        }
        for (pos, deps) in self.deps.iter().enumerate() {
            let name = self.items[pos].id.as_str();
            for dep in deps {
                graph.add_edge(self.items[dep.index()].id.as_str(), name, ());
            }
        }
        graph
    }

    /// Ids of the items a set of handles refers to (sorted, deduplicated).
    pub fn ids(&self, handles: impl IntoIterator<Item = ItemIdx>) -> Vec<ItemId> {
        let set: HashSet<ItemIdx> = handles.into_iter().collect();
        let mut ids: Vec<ItemId> = set.into_iter().map(|h| self.id_of(h).clone()).collect();
        ids.sort();
        ids
    }
}
