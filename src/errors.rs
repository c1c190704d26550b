// src/errors.rs

//! Crate-wide error types.
//!
//! [`PlanError`] covers graph construction, state transitions and IO.
//! [`ExecutionError`] is what an item's execution (or the persistence layer
//! while a run is active) reports; it is classified as fatal or recoverable by
//! a [`crate::state::FatalityPolicy`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::ItemId;
use crate::types::Status;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("duplicate item id: {0}")]
    DuplicateId(ItemId),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("item '{item}' depends on unknown item '{dependency}'")]
    UnresolvedDependency { item: ItemId, dependency: String },

    #[error("dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<ItemId> },

    #[error("invalid transition for '{item}': {from} -> {to}")]
    InvalidTransition { item: ItemId, from: Status, to: Status },

    #[error("guard '{guard}' refused transition of '{item}' to {to}: {reason}")]
    GuardFailed {
        item: ItemId,
        to: Status,
        guard: &'static str,
        reason: String,
    },

    #[error("version conflict on '{item}': expected {expected}, found {actual}")]
    VersionConflict {
        item: ItemId,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlanError {
    /// Errors that can only come out of graph construction.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PlanError::DuplicateId(_)
                | PlanError::UnresolvedDependency { .. }
                | PlanError::CycleDetected { .. }
        )
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, PlanError::VersionConflict { .. })
    }
}

fn format_path(path: &[ItemId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PlanError>;

/// Machine-readable error codes (`DOMAIN_ACTION_OUTCOME`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionLoadFailed,
    SessionSaveFailed,
    SessionNotFound,
    TaskExecutionFailed,
    TaskValidationFailed,
    TaskNotFound,
    AgentLlmFailed,
    AgentTimeout,
    AgentParseFailed,
    ValidationInvalidInput,
    ValidationMissingField,
    ValidationSchemaFailed,
    ValidationCircularDependency,
    ValidationNestedExecution,
    ResourceLimitExceeded,
    ConfigMissing,
    InvalidTransition,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 17] = [
        ErrorCode::SessionLoadFailed,
        ErrorCode::SessionSaveFailed,
        ErrorCode::SessionNotFound,
        ErrorCode::TaskExecutionFailed,
        ErrorCode::TaskValidationFailed,
        ErrorCode::TaskNotFound,
        ErrorCode::AgentLlmFailed,
        ErrorCode::AgentTimeout,
        ErrorCode::AgentParseFailed,
        ErrorCode::ValidationInvalidInput,
        ErrorCode::ValidationMissingField,
        ErrorCode::ValidationSchemaFailed,
        ErrorCode::ValidationCircularDependency,
        ErrorCode::ValidationNestedExecution,
        ErrorCode::ResourceLimitExceeded,
        ErrorCode::ConfigMissing,
        ErrorCode::InvalidTransition,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SessionLoadFailed => "SESSION_LOAD_FAILED",
            ErrorCode::SessionSaveFailed => "SESSION_SAVE_FAILED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::TaskExecutionFailed => "TASK_EXECUTION_FAILED",
            ErrorCode::TaskValidationFailed => "TASK_VALIDATION_FAILED",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::AgentLlmFailed => "AGENT_LLM_FAILED",
            ErrorCode::AgentTimeout => "AGENT_TIMEOUT",
            ErrorCode::AgentParseFailed => "AGENT_PARSE_FAILED",
            ErrorCode::ValidationInvalidInput => "VALIDATION_INVALID_INPUT",
            ErrorCode::ValidationMissingField => "VALIDATION_MISSING_FIELD",
            ErrorCode::ValidationSchemaFailed => "VALIDATION_SCHEMA_FAILED",
            ErrorCode::ValidationCircularDependency => "VALIDATION_CIRCULAR_DEPENDENCY",
            ErrorCode::ValidationNestedExecution => "VALIDATION_NESTED_EXECUTION",
            ErrorCode::ResourceLimitExceeded => "RESOURCE_LIMIT_EXCEEDED",
            ErrorCode::ConfigMissing => "CONFIG_MISSING",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}

/// Error raised while executing an item, or by the session store mid-run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            item: None,
            context: BTreeMap::new(),
        }
    }

    pub fn for_item(mut self, item: &ItemId) -> Self {
        self.item = Some(item.clone());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TaskExecutionFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AgentTimeout, message)
    }

    pub fn session_save(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionSaveFailed, message)
    }

    pub fn session_load(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionLoadFailed, message)
    }
}
