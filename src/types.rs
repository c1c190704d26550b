// src/types.rs

//! Small shared enums used across the graph, state machine and persistence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a plan item.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Status {
    #[default]
    Planned,
    Queued,
    InProgress,
    AwaitingReview,
    Complete,
    Failed,
    Blocked,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Planned,
        Status::Queued,
        Status::InProgress,
        Status::AwaitingReview,
        Status::Complete,
        Status::Failed,
        Status::Blocked,
        Status::Cancelled,
    ];

    /// `Complete`, `Failed`, `Blocked` and `Cancelled` end an item's part in a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Complete | Status::Failed | Status::Blocked | Status::Cancelled
        )
    }

    /// Status that can never turn into `Complete` without operator action.
    pub fn is_unsatisfiable(self) -> bool {
        matches!(self, Status::Failed | Status::Blocked | Status::Cancelled)
    }

    /// Waiting to be picked by the scheduler.
    pub fn is_waiting(self) -> bool {
        matches!(self, Status::Planned | Status::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Planned => "Planned",
            Status::Queued => "Queued",
            Status::InProgress => "InProgress",
            Status::AwaitingReview => "AwaitingReview",
            Status::Complete => "Complete",
            Status::Failed => "Failed",
            Status::Blocked => "Blocked",
            Status::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("invalid status: {s}"))
    }
}

/// Level of an item in the Phase → Milestone → Task → Subtask hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemLevel {
    Phase,
    Milestone,
    Task,
    Subtask,
}

impl ItemLevel {
    /// Number of path segments an id at this level has (`P1.M2` → 2).
    pub fn depth(self) -> usize {
        match self {
            ItemLevel::Phase => 1,
            ItemLevel::Milestone => 2,
            ItemLevel::Task => 3,
            ItemLevel::Subtask => 4,
        }
    }

    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(ItemLevel::Phase),
            2 => Some(ItemLevel::Milestone),
            3 => Some(ItemLevel::Task),
            4 => Some(ItemLevel::Subtask),
            _ => None,
        }
    }
}

impl fmt::Display for ItemLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemLevel::Phase => "phase",
            ItemLevel::Milestone => "milestone",
            ItemLevel::Task => "task",
            ItemLevel::Subtask => "subtask",
        };
        f.write_str(s)
    }
}

/// How session state is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Snapshot + transition log in a session directory.
    #[default]
    File,
    /// Keep everything in memory (lost on exit).
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("inprogress".parse::<Status>().unwrap(), Status::InProgress);
        assert_eq!(" Complete ".parse::<Status>().unwrap(), Status::Complete);
        assert!("Done".parse::<Status>().is_err());
    }

    #[test]
    fn unsatisfiable_statuses_are_terminal() {
        for st in Status::ALL {
            if st.is_unsatisfiable() {
                assert!(st.is_terminal(), "{st} should be terminal");
            }
        }
    }

    #[test]
    fn defaults_are_planned_and_file_backed() {
        assert_eq!(Status::default(), Status::Planned);
        assert_eq!(PersistenceMode::default(), PersistenceMode::File);
    }
}
