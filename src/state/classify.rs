// src/state/classify.rs

//! Fatal-vs-recoverable classification of execution errors.

use std::collections::BTreeSet;
use std::fmt;

use crate::errors::{ErrorCode, ExecutionError};

/// Codes that halt a run unless `continue_on_error` is set.
pub const DEFAULT_FATAL_CODES: [ErrorCode; 4] = [
    ErrorCode::SessionLoadFailed,
    ErrorCode::SessionSaveFailed,
    ErrorCode::ConfigMissing,
    ErrorCode::ValidationNestedExecution,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Stop dispatching and halt the run.
    Fatal,
    /// Fail the item (and block its dependents); the run continues.
    Recoverable,
}

pub trait FatalityPolicy: Send + Sync + fmt::Debug {
    fn classify(&self, err: &ExecutionError) -> Severity;

    fn is_fatal(&self, err: &ExecutionError) -> bool {
        self.classify(err) == Severity::Fatal
    }
}

/// Classifies by error code against a configurable fatal set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePolicy {
    fatal: BTreeSet<ErrorCode>,
    continue_on_error: bool,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FATAL_CODES, false)
    }
}

impl CodePolicy {
    pub fn new(fatal: impl IntoIterator<Item = ErrorCode>, continue_on_error: bool) -> Self {
        Self {
            fatal: fatal.into_iter().collect(),
            continue_on_error,
        }
    }

    pub fn fatal_codes(&self) -> impl Iterator<Item = ErrorCode> + '_ {
        self.fatal.iter().copied()
    }

    pub fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }
}

impl FatalityPolicy for CodePolicy {
    fn classify(&self, err: &ExecutionError) -> Severity {
        if !self.continue_on_error && self.fatal.contains(&err.code) {
            Severity::Fatal
        } else {
            Severity::Recoverable
        }
    }
}
