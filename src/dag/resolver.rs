// src/dag/resolver.rs

//! Execution-order resolution.
//!
//! [`DependencyResolver::resolve`] runs Kahn's algorithm over the execution
//! edges of a [`GraphStore`] (explicit hard dependencies, containment and
//! inherited dependencies). Each BFS wave becomes a *level*: items in a level
//! have no execution relation among them. Within a level, soft dependencies
//! order items (never block), then ascending id.
//!
//! When the graph has a cycle, a path-tracking DFS over the unresolved items
//! extracts one concrete cycle for [`PlanError::CycleDetected`].

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::dag::graph::GraphStore;
use crate::dag::item::{ItemId, ItemIdx};
use crate::errors::{PlanError, Result};

/// Output of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    order: Vec<ItemIdx>,
    levels: Vec<Vec<ItemIdx>>,
    /// Level per item handle; indexed by `ItemIdx::index`.
    level_of: Vec<usize>,
}

pub struct DependencyResolver;

impl DependencyResolver {
    /// Full resolution of the whole graph.
    pub fn resolve(graph: &GraphStore) -> Result<Resolution> {
        let n = graph.len();
        let forward: Vec<Vec<ItemIdx>> = graph
            .indices()
            .map(|idx| graph.execution_dependencies(idx))
            .collect();
        let mut reverse: Vec<Vec<ItemIdx>> = vec![Vec::new(); n];
        for (pos, deps) in forward.iter().enumerate() {
            for d in deps {
                reverse[d.index()].push(ItemIdx(pos as u32));
            }
        }

        let mut in_degree: Vec<usize> = forward.iter().map(Vec::len).collect();
        let mut current: Vec<ItemIdx> = graph
            .indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .collect();

        let mut levels: Vec<Vec<ItemIdx>> = Vec::new();
        let mut level_of = vec![0usize; n];
        let mut emitted = 0usize;

        while !current.is_empty() {
            let level = order_within_level(graph, &current);
            let mut next = Vec::new();
            for &idx in &level {
                level_of[idx.index()] = levels.len();
                for &r in &reverse[idx.index()] {
                    in_degree[r.index()] -= 1;
                    if in_degree[r.index()] == 0 {
                        next.push(r);
                    }
                }
            }
            emitted += level.len();
            trace!(level = levels.len(), size = level.len(), "resolved level");
            levels.push(level);
            current = next;
        }

        if emitted < n {
            let unresolved: HashSet<ItemIdx> = graph
                .indices()
                .filter(|idx| in_degree[idx.index()] > 0)
                .collect();
            let path = find_cycle(graph, &unresolved);
            debug!(?path, "dependency cycle detected");
            return Err(PlanError::CycleDetected { path });
        }

        let order = levels.iter().flatten().copied().collect();
        debug!(items = n, levels = levels.len(), "dependency resolution complete");

        Ok(Resolution {
            order,
            levels,
            level_of,
        })
    }
}

impl Resolution {
    /// Topological order: level by level.
    pub fn order(&self) -> &[ItemIdx] {
        &self.order
    }

    pub fn levels(&self) -> &[Vec<ItemIdx>] {
        &self.levels
    }

    pub fn level_of(&self, idx: ItemIdx) -> Option<usize> {
        self.level_of.get(idx.index()).copied()
    }

    pub fn order_ids(&self, graph: &GraphStore) -> Vec<ItemId> {
        self.order.iter().map(|i| graph.id_of(*i).clone()).collect()
    }

    pub fn level_ids(&self, graph: &GraphStore) -> Vec<Vec<ItemId>> {
        self.levels
            .iter()
            .map(|lvl| lvl.iter().map(|i| graph.id_of(*i).clone()).collect())
            .collect()
    }

    /// Re-level after `changed` gained/lost edges or was newly added.
    ///
    /// Only items reachable from `changed` through reverse execution edges
    /// get new levels; everything upstream keeps its level. On a cycle the
    /// resolution is left untouched and the cycle is reported.
    pub fn relevel(&mut self, graph: &GraphStore, changed: ItemIdx) -> Result<()> {
        let n = graph.len();
        if self.level_of.len() < n {
            self.level_of.resize(n, 0);
        }

        // Affected subgraph: changed + all transitive execution dependents.
        let mut affected: BTreeSet<ItemIdx> = BTreeSet::new();
        let mut queue = VecDeque::from([changed]);
        while let Some(node) = queue.pop_front() {
            if affected.insert(node) {
                queue.extend(graph.execution_dependents(node));
            }
        }

        let forward: Vec<(ItemIdx, Vec<ItemIdx>)> = affected
            .iter()
            .map(|&a| (a, graph.execution_dependencies(a)))
            .collect();

        let mut in_degree: std::collections::HashMap<ItemIdx, usize> = forward
            .iter()
            .map(|(a, deps)| (*a, deps.iter().filter(|d| affected.contains(d)).count()))
            .collect();
        let mut reverse: std::collections::HashMap<ItemIdx, Vec<ItemIdx>> =
            std::collections::HashMap::new();
        for (a, deps) in &forward {
            for d in deps.iter().filter(|d| affected.contains(d)) {
                reverse.entry(*d).or_default().push(*a);
            }
        }

        let mut ready: VecDeque<ItemIdx> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(a, _)| *a)
            .collect();
        let mut new_levels = self.level_of.clone();
        let mut processed = 0usize;

        while let Some(node) = ready.pop_front() {
            let level = graph
                .execution_dependencies(node)
                .iter()
                .map(|d| new_levels[d.index()] + 1)
                .max()
                .unwrap_or(0);
            new_levels[node.index()] = level;
            processed += 1;

            if let Some(dependents) = reverse.get(&node) {
                for r in dependents {
                    if let Some(deg) = in_degree.get_mut(r) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(*r);
                        }
                    }
                }
            }
        }

        if processed < affected.len() {
            let unresolved: HashSet<ItemIdx> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(a, _)| a)
                .collect();
            let path = find_cycle(graph, &unresolved);
            debug!(?path, "cycle introduced by graph mutation");
            return Err(PlanError::CycleDetected { path });
        }

        let depth = new_levels.iter().take(n).max().map_or(0, |m| m + 1);
        let mut buckets: Vec<Vec<ItemIdx>> = vec![Vec::new(); if n == 0 { 0 } else { depth }];
        for idx in graph.indices() {
            buckets[new_levels[idx.index()]].push(idx);
        }
        let levels: Vec<Vec<ItemIdx>> = buckets
            .into_iter()
            .filter(|b| !b.is_empty())
            .map(|b| order_within_level(graph, &b))
            .collect();

        debug!(
            changed = %graph.id_of(changed),
            affected = affected.len(),
            levels = levels.len(),
            "incremental re-leveling complete"
        );

        self.level_of = new_levels;
        self.order = levels.iter().flatten().copied().collect();
        self.levels = levels;
        Ok(())
    }
}

/// Order the members of one level: soft dependencies first (Kahn restricted
/// to the level, smallest id first), soft cycles fall back to id order.
fn order_within_level(graph: &GraphStore, members: &[ItemIdx]) -> Vec<ItemIdx> {
    let member_set: HashSet<ItemIdx> = members.iter().copied().collect();
    let mut soft_in: std::collections::HashMap<ItemIdx, usize> = members
        .iter()
        .map(|&m| {
            let deg = graph
                .soft_dependencies(m)
                .iter()
                .filter(|d| member_set.contains(d))
                .count();
            (m, deg)
        })
        .collect();

    let mut ready: BTreeSet<(&ItemId, ItemIdx)> = members
        .iter()
        .filter(|m| soft_in[m] == 0)
        .map(|&m| (graph.id_of(m), m))
        .collect();

    let mut out = Vec::with_capacity(members.len());
    while let Some((_, node)) = ready.pop_first() {
        out.push(node);
        for &sd in graph.soft_dependents(node) {
            if let Some(deg) = soft_in.get_mut(&sd) {
                *deg -= 1;
                if *deg == 0 {
                    ready.insert((graph.id_of(sd), sd));
                }
            }
        }
    }

    if out.len() < members.len() {
        let placed: HashSet<ItemIdx> = out.iter().copied().collect();
        let mut rest: Vec<ItemIdx> = members
            .iter()
            .copied()
            .filter(|m| !placed.contains(m))
            .collect();
        graph.sort_by_id(&mut rest);
        out.extend(rest);
    }

    out
}

/// Extract one concrete cycle among `unresolved` items.
///
/// Deterministic: roots are visited in ascending id order and dependencies in
/// ascending id order. The returned path is closed (`[A, B, C, A]`).
pub fn find_cycle(graph: &GraphStore, unresolved: &HashSet<ItemIdx>) -> Vec<ItemId> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let mut marks: std::collections::HashMap<ItemIdx, Mark> =
        unresolved.iter().map(|&u| (u, Mark::White)).collect();
    let mut roots: Vec<ItemIdx> = unresolved.iter().copied().collect();
    graph.sort_by_id(&mut roots);

    for root in roots {
        if marks[&root] != Mark::White {
            continue;
        }

        let mut path: Vec<ItemIdx> = vec![root];
        let mut stack: Vec<(ItemIdx, Vec<ItemIdx>, usize)> = vec![(
            root,
            restricted_deps(graph, root, unresolved),
            0,
        )];
        marks.insert(root, Mark::Gray);

        while let Some((node, deps, pos)) = stack.last_mut() {
            if *pos >= deps.len() {
                marks.insert(*node, Mark::Black);
                stack.pop();
                path.pop();
                continue;
            }
            let next = deps[*pos];
            *pos += 1;

            match marks[&next] {
                Mark::Gray => {
                    let start = path.iter().position(|p| *p == next).unwrap_or(0);
                    let mut cycle: Vec<ItemId> = path[start..]
                        .iter()
                        .map(|p| graph.id_of(*p).clone())
                        .collect();
                    cycle.push(graph.id_of(next).clone());
                    return cycle;
                }
                Mark::White => {
                    marks.insert(next, Mark::Gray);
                    path.push(next);
                    let next_deps = restricted_deps(graph, next, unresolved);
                    stack.push((next, next_deps, 0));
                }
                Mark::Black => {}
            }
        }
    }

    Vec::new()
}

fn restricted_deps(graph: &GraphStore, idx: ItemIdx, within: &HashSet<ItemIdx>) -> Vec<ItemIdx> {
    graph
        .execution_dependencies(idx)
        .into_iter()
        .filter(|d| within.contains(d))
        .collect()
}

/// Raise each item's effective priority to the highest base priority among
/// its transitive execution dependents.
pub fn inherit_priorities(graph: &mut GraphStore, resolution: &Resolution) {
    graph.reset_priorities();
    for &idx in resolution.order().iter().rev() {
        let inherited = graph
            .execution_dependents(idx)
            .into_iter()
            .map(|d| graph.item(d).priority)
            .max()
            .unwrap_or(0);
        if graph.raise_priority(idx, inherited) {
            trace!(
                item = %graph.id_of(idx),
                priority = inherited,
                "priority inherited from dependents"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::item::{Item, StoryPoints};
    use crate::types::ItemLevel;

    fn id(s: &str) -> ItemId {
        s.parse().unwrap()
    }

    fn item(s: &str, deps: &[&str]) -> Item {
        let mut it = Item::new(id(s)).with_dependencies(deps.iter().map(|d| id(d)));
        if it.level() == ItemLevel::Subtask {
            it.story_points = Some(StoryPoints::try_from(2).unwrap());
        }
        it
    }

    fn ids(v: &[&str]) -> Vec<ItemId> {
        v.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn diamond_resolves_into_three_levels() {
        let g = GraphStore::from_items([
            item("P1", &[]),
            item("P2", &["P1"]),
            item("P3", &["P1"]),
            item("P4", &["P2", "P3"]),
        ])
        .unwrap();

        let res = DependencyResolver::resolve(&g).unwrap();
        assert_eq!(
            res.level_ids(&g),
            vec![ids(&["P1"]), ids(&["P2", "P3"]), ids(&["P4"])]
        );
        assert_eq!(res.order_ids(&g), ids(&["P1", "P2", "P3", "P4"]));
    }

    #[test]
    fn three_cycle_is_reported_as_closed_path() {
        let g = GraphStore::from_items([
            item("P1", &["P2"]),
            item("P2", &["P3"]),
            item("P3", &["P1"]),
        ])
        .unwrap();

        match DependencyResolver::resolve(&g) {
            Err(PlanError::CycleDetected { path }) => {
                assert_eq!(path, ids(&["P1", "P2", "P3", "P1"]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_downstream_items_are_not_in_reported_path() {
        let g = GraphStore::from_items([
            item("P1", &["P3"]),
            item("P2", &["P3"]),
            item("P3", &["P2"]),
        ])
        .unwrap();

        match DependencyResolver::resolve(&g) {
            Err(PlanError::CycleDetected { path }) => {
                assert_eq!(path, ids(&["P2", "P3", "P2"]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn containment_deadlock_is_a_cycle() {
        // The subtask waits for a sibling phase that waits for the subtask's
        // own phase to complete.
        let g = GraphStore::from_items([
            item("P1", &[]),
            item("P1.M1", &[]),
            item("P1.M1.T1", &[]),
            item("P1.M1.T1.S1", &["P2"]),
            item("P2", &["P1"]),
        ])
        .unwrap();

        assert!(matches!(
            DependencyResolver::resolve(&g),
            Err(PlanError::CycleDetected { .. })
        ));
    }

    #[test]
    fn containers_come_after_their_children() {
        let g = GraphStore::from_items([
            item("P1", &[]),
            item("P1.M1", &[]),
            item("P1.M1.T1", &[]),
            item("P1.M1.T2", &["P1.M1.T1"]),
        ])
        .unwrap();
        let res = DependencyResolver::resolve(&g).unwrap();
        assert_eq!(
            res.level_ids(&g),
            vec![
                ids(&["P1.M1.T1"]),
                ids(&["P1.M1.T2"]),
                ids(&["P1.M1"]),
                ids(&["P1"]),
            ]
        );
    }

    #[test]
    fn soft_dependencies_reorder_within_level_without_blocking() {
        let mut p2 = item("P2", &[]);
        p2.soft_dependencies = ids(&["P3"]);
        let g = GraphStore::from_items([item("P1", &[]), p2, item("P3", &[])]).unwrap();

        let res = DependencyResolver::resolve(&g).unwrap();
        assert_eq!(res.levels().len(), 1);
        assert_eq!(res.order_ids(&g), ids(&["P1", "P3", "P2"]));
    }

    #[test]
    fn soft_cycles_fall_back_to_id_order() {
        let mut p1 = item("P1", &[]);
        p1.soft_dependencies = ids(&["P2"]);
        let mut p2 = item("P2", &[]);
        p2.soft_dependencies = ids(&["P1"]);
        let g = GraphStore::from_items([p2, p1]).unwrap();

        let res = DependencyResolver::resolve(&g).unwrap();
        assert_eq!(res.order_ids(&g), ids(&["P1", "P2"]));
    }

    #[test]
    fn relevel_matches_full_resolution_after_edge_insert() {
        let mut g = GraphStore::from_items([
            item("P1", &[]),
            item("P2", &[]),
            item("P3", &["P2"]),
            item("P4", &[]),
        ])
        .unwrap();
        let mut res = DependencyResolver::resolve(&g).unwrap();

        g.add_dependency(&id("P2"), &id("P1")).unwrap();
        let p2 = g.index_of(&id("P2")).unwrap();
        res.relevel(&g, p2).unwrap();

        assert_eq!(res, DependencyResolver::resolve(&g).unwrap());
        assert_eq!(
            res.level_ids(&g),
            vec![ids(&["P1", "P4"]), ids(&["P2"]), ids(&["P3"])]
        );
    }

    #[test]
    fn relevel_reports_cycle_and_keeps_previous_resolution() {
        let mut g =
            GraphStore::from_items([item("P1", &[]), item("P2", &["P1"])]).unwrap();
        let mut res = DependencyResolver::resolve(&g).unwrap();
        let before = res.clone();

        g.add_dependency(&id("P1"), &id("P2")).unwrap();
        let p1 = g.index_of(&id("P1")).unwrap();
        let err = res.relevel(&g, p1).unwrap_err();

        assert!(matches!(err, PlanError::CycleDetected { .. }));
        assert_eq!(res, before);
    }

    #[test]
    fn priorities_flow_to_prerequisites() {
        let mut g = GraphStore::from_items([
            item("P1", &[]),
            item("P2", &["P1"]).with_priority(7),
            item("P3", &[]).with_priority(2),
        ])
        .unwrap();
        let res = DependencyResolver::resolve(&g).unwrap();
        inherit_priorities(&mut g, &res);

        assert_eq!(g.get("P1").unwrap().priority, 7);
        assert_eq!(g.get("P1").unwrap().base_priority, 0);
        assert_eq!(g.get("P3").unwrap().priority, 2);
    }
}
