// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::{AgingPolicy, SchedulerOptions};
use crate::engine::RuntimeOptions;
use crate::errors::ErrorCode;
use crate::persist::DEFAULT_CONFLICT_ATTEMPTS;
use crate::state::CodePolicy;
use crate::types::{PersistenceMode, Status};

/// Run configuration exactly as read from `Plandag.toml`.
///
/// ```toml
/// [scheduler]
/// max_concurrency = 4
/// aging_interval = "30s"
/// grace_period = "30s"
/// item_timeout = "30m"
///
/// [run]
/// continue_on_error = false
/// retry_failed_on_resume = true
///
/// [session]
/// mode = "file"
/// dir = ".plandag/session"
/// snapshot_every = 16
/// ```
///
/// All sections are optional. Durations stay strings here; they are parsed
/// when converting into [`RunConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunConfig {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,
    #[serde(default)]
    pub run: RawRunSection,
    #[serde(default)]
    pub session: RawSessionSection,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSchedulerSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long an item waits in the queue per aging step.
    #[serde(default = "default_aging_interval")]
    pub aging_interval: String,

    #[serde(default = "default_aging_step")]
    pub aging_step: u32,

    /// Upper bound on the priority boost from waiting.
    #[serde(default = "default_aging_cap")]
    pub aging_cap: u32,

    /// How long in-flight items may keep running after a fatal error.
    #[serde(default = "default_grace_period")]
    pub grace_period: String,

    #[serde(default)]
    pub item_timeout: Option<String>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_aging_interval() -> String {
    "30s".to_string()
}

fn default_aging_step() -> u32 {
    1
}

fn default_aging_cap() -> u32 {
    10
}

fn default_grace_period() -> String {
    "30s".to_string()
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            aging_interval: default_aging_interval(),
            aging_step: default_aging_step(),
            aging_cap: default_aging_cap(),
            grace_period: default_grace_period(),
            item_timeout: None,
        }
    }
}

/// `[run]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunSection {
    /// Treat every error as recoverable.
    #[serde(default)]
    pub continue_on_error: bool,

    /// On resume, put `Failed` and `Blocked` leaves back to `Planned`.
    #[serde(default = "default_true")]
    pub retry_failed_on_resume: bool,

    /// Error codes that halt the run; `None` keeps the built-in set.
    #[serde(default)]
    pub fatal_codes: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl Default for RawRunSection {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            retry_failed_on_resume: true,
            fatal_codes: None,
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSessionSection {
    #[serde(default)]
    pub mode: PersistenceMode,

    #[serde(default = "default_session_dir")]
    pub dir: PathBuf,

    /// Commits between snapshot compactions.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: usize,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from(".plandag/session")
}

fn default_snapshot_every() -> usize {
    16
}

impl Default for RawSessionSection {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::default(),
            dir: default_session_dir(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

/// Validated run configuration.
///
/// Only constructed through `TryFrom<RawRunConfig>` (see `validate.rs`) or
/// [`RunConfig::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub scheduler: SchedulerConfig,
    pub run: RunSection,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub aging: AgingPolicy,
    pub grace_period: Duration,
    pub item_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSection {
    pub continue_on_error: bool,
    pub retry_failed_on_resume: bool,
    pub fatal_codes: Vec<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub mode: PersistenceMode,
    pub dir: PathBuf,
    pub snapshot_every: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        // The raw defaults always validate.
        Self::new_unchecked(
            SchedulerConfig {
                max_concurrency: default_max_concurrency(),
                aging: AgingPolicy::default(),
                grace_period: Duration::from_secs(30),
                item_timeout: None,
            },
            RunSection {
                continue_on_error: false,
                retry_failed_on_resume: true,
                fatal_codes: crate::state::DEFAULT_FATAL_CODES.to_vec(),
            },
            SessionConfig {
                mode: PersistenceMode::File,
                dir: default_session_dir(),
                snapshot_every: default_snapshot_every(),
            },
        )
    }
}

impl RunConfig {
    pub(crate) fn new_unchecked(
        scheduler: SchedulerConfig,
        run: RunSection,
        session: SessionConfig,
    ) -> Self {
        Self {
            scheduler,
            run,
            session,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrency: self.scheduler.max_concurrency,
            aging: self.scheduler.aging,
            item_timeout: self.scheduler.item_timeout,
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            grace_period: self.scheduler.grace_period,
        }
    }

    pub fn fatality_policy(&self) -> CodePolicy {
        CodePolicy::new(self.run.fatal_codes.iter().copied(), self.run.continue_on_error)
    }
}

/// Hierarchy document (`tasks.json`): `{ "backlog": [ phase, ... ] }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Backlog {
    pub backlog: Vec<ItemDoc>,
}

/// One phase, milestone, task or subtask as authored.
///
/// Which child list may be present depends on the level: phases carry
/// `milestones`, milestones carry `tasks`, tasks carry `subtasks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemDoc {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub soft_dependencies: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub milestones: Vec<ItemDoc>,
    #[serde(default)]
    pub tasks: Vec<ItemDoc>,
    #[serde(default)]
    pub subtasks: Vec<ItemDoc>,
}
