// src/dag/item.rs

//! Item identity and per-item data held by the graph store.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PlanError;
use crate::types::{ItemLevel, Status};

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^P\d+(\.M\d+(\.T\d+(\.S\d+)?)?)?$").expect("item id pattern is valid")
    })
}

/// Hierarchical item id such as `P1.M2.T3.S1`.
///
/// Ids order segment by segment on their numbers, so `P2` sorts before
/// `P10` and a container before everything under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn level(&self) -> ItemLevel {
        // The pattern guarantees 1..=4 segments.
        ItemLevel::from_depth(self.0.split('.').count()).unwrap_or(ItemLevel::Subtask)
    }

    /// Id of the containing item, `None` for phases.
    pub fn parent(&self) -> Option<ItemId> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| ItemId(parent.to_string()))
    }

    /// Whether `self` is the direct parent of `child`.
    pub fn is_parent_of(&self, child: &ItemId) -> bool {
        child.parent().as_ref() == Some(self)
    }

    /// Digits of each segment, without the level letter.
    fn numbers(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').map(|segment| &segment[1..])
    }
}

/// Compare two digit strings by value without parsing them.
fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut ours = self.numbers();
        let mut theirs = other.numbers();
        loop {
            match (ours.next(), theirs.next()) {
                (Some(a), Some(b)) => match cmp_digits(a, b) {
                    Ordering::Equal => {}
                    unequal => return unequal,
                },
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                // Equal values spelled differently (`P01`, `P1`) still need a total order.
                (None, None) => return self.0.cmp(&other.0),
            }
        }
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ItemId {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if id_pattern().is_match(s) {
            Ok(ItemId(s.to_string()))
        } else {
            Err(PlanError::InvalidItem(format!(
                "malformed item id '{s}' (expected P<n>[.M<n>[.T<n>[.S<n>]]])"
            )))
        }
    }
}

impl TryFrom<String> for ItemId {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Story points allowed on a subtask.
pub const ADMISSIBLE_STORY_POINTS: [u8; 7] = [1, 2, 3, 5, 8, 13, 21];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct StoryPoints(u8);

impl StoryPoints {
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u32> for StoryPoints {
    type Error = PlanError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ADMISSIBLE_STORY_POINTS
            .iter()
            .copied()
            .find(|p| u32::from(*p) == value)
            .map(StoryPoints)
            .ok_or_else(|| {
                PlanError::InvalidItem(format!(
                    "story points {value} not in admissible set {ADMISSIBLE_STORY_POINTS:?}"
                ))
            })
    }
}

impl From<StoryPoints> for u32 {
    fn from(points: StoryPoints) -> Self {
        u32::from(points.0)
    }
}

/// Stable arena handle for an item inside a [`crate::dag::GraphStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemIdx(pub(crate) u32);

impl ItemIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of the plan.
///
/// Identity and dependencies are fixed once the item is in the store; status,
/// version and effective priority change through the store's update methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
    #[serde(default)]
    pub soft_dependencies: Vec<ItemId>,
    /// Priority as authored.
    #[serde(default)]
    pub base_priority: u32,
    /// Effective priority after inheritance from dependents.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<StoryPoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Item {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            title: String::new(),
            status: Status::Planned,
            dependencies: Vec::new(),
            soft_dependencies: Vec::new(),
            base_priority: 0,
            priority: 0,
            version: 0,
            story_points: None,
            command: None,
        }
    }

    pub fn level(&self) -> ItemLevel {
        self.id.level()
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = ItemId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.base_priority = priority;
        self.priority = priority;
        self
    }

    /// Check the per-item invariants that do not need the rest of the graph.
    pub fn validate(&self) -> Result<(), PlanError> {
        match (self.level(), self.story_points) {
            (ItemLevel::Subtask, None) => {
                return Err(PlanError::InvalidItem(format!(
                    "subtask '{}' is missing story_points",
                    self.id
                )));
            }
            (level, Some(_)) if level != ItemLevel::Subtask => {
                return Err(PlanError::InvalidItem(format!(
                    "{level} '{}' cannot carry story_points (subtasks only)",
                    self.id
                )));
            }
            _ => {}
        }

        let mut seen = std::collections::HashSet::new();
        for dep in self.dependencies.iter().chain(self.soft_dependencies.iter()) {
            if dep == &self.id {
                return Err(PlanError::InvalidItem(format!(
                    "item '{}' cannot depend on itself",
                    self.id
                )));
            }
            if !seen.insert(dep) {
                return Err(PlanError::InvalidItem(format!(
                    "item '{}' lists dependency '{}' more than once",
                    self.id, dep
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ItemId {
        s.parse().unwrap()
    }

    #[test]
    fn ids_follow_the_hierarchy_pattern() {
        assert_eq!(id("P1").level(), ItemLevel::Phase);
        assert_eq!(id("P1.M2").level(), ItemLevel::Milestone);
        assert_eq!(id("P1.M2.T3").level(), ItemLevel::Task);
        assert_eq!(id("P10.M2.T3.S14").level(), ItemLevel::Subtask);

        for bad in ["", "M1", "P1.T1", "P1.M1.T1.S1.X1", "p1", "P1.M", "P1 .M1"] {
            assert!(bad.parse::<ItemId>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn parent_strips_last_segment() {
        assert_eq!(id("P1.M2.T3").parent(), Some(id("P1.M2")));
        assert_eq!(id("P1").parent(), None);
        assert!(id("P1.M2").is_parent_of(&id("P1.M2.T1")));
        assert!(!id("P1.M2").is_parent_of(&id("P1.M2.T1.S1")));
    }

    #[test]
    fn ids_order_by_segment_number() {
        let mut ids = vec![
            id("P10"),
            id("P2.M10"),
            id("P2"),
            id("P2.M2"),
            id("P1.M1.T1.S12"),
            id("P1.M1.T1.S3"),
            id("P1"),
        ];
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(ItemId::as_str).collect();
        assert_eq!(
            sorted,
            ["P1", "P1.M1.T1.S3", "P1.M1.T1.S12", "P2", "P2.M2", "P2.M10", "P10"]
        );
        assert!(id("P01") < id("P1") && id("P1") < id("P2"));
    }

    #[test]
    fn story_points_are_bounded() {
        assert_eq!(StoryPoints::try_from(5).unwrap().value(), 5);
        assert!(StoryPoints::try_from(4).is_err());
        assert!(StoryPoints::try_from(0).is_err());
    }

    #[test]
    fn story_points_only_on_subtasks() {
        let mut task = Item::new(id("P1.M1.T1"));
        task.story_points = Some(StoryPoints::try_from(3).unwrap());
        assert!(task.validate().is_err());

        let subtask = Item::new(id("P1.M1.T1.S1"));
        assert!(subtask.validate().is_err());
    }

    #[test]
    fn self_and_duplicate_dependencies_are_rejected() {
        let item = Item::new(id("P2")).with_dependencies([id("P2")]);
        assert!(item.validate().is_err());

        let item = Item::new(id("P3")).with_dependencies([id("P1"), id("P1")]);
        assert!(item.validate().is_err());
    }

    #[test]
    fn item_id_deserializes_with_validation() {
        let ok: ItemId = serde_json::from_str("\"P1.M1\"").unwrap();
        assert_eq!(ok, id("P1.M1"));
        assert!(serde_json::from_str::<ItemId>("\"X1\"").is_err());
    }
}
