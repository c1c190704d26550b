// src/persist/record.rs

//! Append-only transition records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::ItemId;
use crate::types::Status;

/// Who caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Scheduler,
    Executor,
    Propagation,
    Recovery,
    Operator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Actor::Scheduler => "scheduler",
            Actor::Executor => "executor",
            Actor::Propagation => "propagation",
            Actor::Recovery => "recovery",
            Actor::Operator => "operator",
        };
        f.write_str(s)
    }
}

/// One status change of one item. Never mutated after it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Assigned by the store on commit; 0 until then.
    #[serde(default)]
    pub seq: u64,
    pub item: ItemId,
    pub from: Status,
    pub to: Status,
    /// Item version after this transition.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl TransitionRecord {
    pub fn new(item: ItemId, from: Status, to: Status, actor: Actor) -> Self {
        Self {
            seq: 0,
            item,
            from,
            to,
            version: 0,
            timestamp: Utc::now(),
            actor,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context.extend(context);
        self
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_lowercase_actor() {
        let id: ItemId = "P1.M1".parse().unwrap();
        let mut ctx = BTreeMap::new();
        ctx.insert("error_code".to_string(), "AGENT_TIMEOUT".to_string());
        let rec = TransitionRecord::new(id, Status::InProgress, Status::Failed, Actor::Executor)
            .with_context(ctx);

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["actor"], "executor");
        assert_eq!(json["to"], "Failed");
        assert_eq!(rec.context_value("error_code"), Some("AGENT_TIMEOUT"));

        let back: TransitionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
