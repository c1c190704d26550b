// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    Backlog, ItemDoc, RawRunConfig, RunConfig, RunSection, SchedulerConfig, SessionConfig,
};
use crate::dag::{AgingPolicy, Item, ItemId, StoryPoints};
use crate::errors::{ErrorCode, PlanError, Result};
use crate::state::DEFAULT_FATAL_CODES;
use crate::types::ItemLevel;

impl TryFrom<RawRunConfig> for RunConfig {
    type Error = PlanError;

    fn try_from(raw: RawRunConfig) -> std::result::Result<Self, Self::Error> {
        let sched = raw.scheduler;
        if sched.max_concurrency == 0 {
            return Err(PlanError::Config(
                "[scheduler].max_concurrency must be >= 1 (got 0)".to_string(),
            ));
        }

        let aging_interval = field_duration("scheduler.aging_interval", &sched.aging_interval)?;
        if aging_interval.is_zero() {
            return Err(PlanError::Config(
                "[scheduler].aging_interval must be greater than zero".to_string(),
            ));
        }
        let grace_period = field_duration("scheduler.grace_period", &sched.grace_period)?;
        let item_timeout = sched
            .item_timeout
            .as_deref()
            .map(|s| field_duration("scheduler.item_timeout", s))
            .transpose()?;

        if raw.session.snapshot_every == 0 {
            return Err(PlanError::Config(
                "[session].snapshot_every must be >= 1 (got 0)".to_string(),
            ));
        }

        let fatal_codes = match raw.run.fatal_codes {
            None => DEFAULT_FATAL_CODES.to_vec(),
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<ErrorCode>()
                        .map_err(|e| PlanError::Config(format!("[run].fatal_codes: {e}")))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(RunConfig::new_unchecked(
            SchedulerConfig {
                max_concurrency: sched.max_concurrency,
                aging: AgingPolicy {
                    interval: aging_interval,
                    step: sched.aging_step,
                    cap: sched.aging_cap,
                },
                grace_period,
                item_timeout,
            },
            RunSection {
                continue_on_error: raw.run.continue_on_error,
                retry_failed_on_resume: raw.run.retry_failed_on_resume,
                fatal_codes,
            },
            SessionConfig {
                mode: raw.session.mode,
                dir: raw.session.dir,
                snapshot_every: raw.session.snapshot_every,
            },
        ))
    }
}

fn field_duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| PlanError::Config(format!("[{field}] {e}")))
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;
    let unit = unit_part.trim().to_lowercase();

    let seconds_per = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => {
            return Err(format!(
                "unsupported duration unit '{unit}'; expected ms, s, m, or h"
            ));
        }
    };
    value
        .checked_mul(seconds_per)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}

/// Flatten the authored hierarchy into items, checking what can be checked
/// without the graph: id shape, containment, child lists per level and
/// story points.
pub fn flatten_backlog(doc: Backlog) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for phase in doc.backlog {
        flatten_node(phase, None, &mut items)?;
    }
    Ok(items)
}

fn flatten_node(doc: ItemDoc, parent: Option<&ItemId>, out: &mut Vec<Item>) -> Result<()> {
    let id: ItemId = doc.id.parse()?;

    match parent {
        None if id.level() != ItemLevel::Phase => {
            return Err(PlanError::InvalidItem(format!(
                "top-level backlog entry '{id}' must be a phase"
            )));
        }
        Some(p) if !p.is_parent_of(&id) => {
            return Err(PlanError::InvalidItem(format!(
                "item '{id}' is listed under '{p}' but its id does not extend it"
            )));
        }
        _ => {}
    }

    let mut lists = [
        ("milestones", doc.milestones),
        ("tasks", doc.tasks),
        ("subtasks", doc.subtasks),
    ];
    let allowed = match id.level() {
        ItemLevel::Phase => Some(0),
        ItemLevel::Milestone => Some(1),
        ItemLevel::Task => Some(2),
        ItemLevel::Subtask => None,
    };
    for (pos, (field, list)) in lists.iter().enumerate() {
        if Some(pos) != allowed && !list.is_empty() {
            return Err(PlanError::InvalidItem(format!(
                "{} '{id}' cannot have `{field}`",
                id.level()
            )));
        }
    }
    let children = allowed
        .map(|pos| std::mem::take(&mut lists[pos].1))
        .unwrap_or_default();

    let mut item = Item::new(id.clone())
        .with_dependencies(parse_ids(&doc.dependencies)?)
        .with_priority(doc.priority);
    item.title = doc.title;
    item.soft_dependencies = parse_ids(&doc.soft_dependencies)?;
    item.command = doc.command;
    item.status = doc.status.unwrap_or_default();
    item.story_points = doc.story_points.map(StoryPoints::try_from).transpose()?;
    item.validate()?;
    out.push(item);

    for child in children {
        flatten_node(child, Some(&id), out)?;
    }
    Ok(())
}

fn parse_ids(raw: &[String]) -> Result<Vec<ItemId>> {
    raw.iter().map(|s| s.parse()).collect()
}
