// src/persist/retry.rs

//! Bounded retry for optimistic-concurrency conflicts.

use tracing::debug;

use crate::errors::Result;

/// Default number of attempts used by the scheduler.
pub const DEFAULT_CONFLICT_ATTEMPTS: usize = 3;

/// Call `op(attempt)` until it returns something other than a
/// `VersionConflict`, or `max_attempts` calls have been made.
///
/// `op` must re-read whatever state it depends on each time it is called;
/// the combinator only decides whether to call it again. The last result is
/// returned as-is, so an exhausted retry surfaces the final conflict.
pub fn with_conflict_retry<T, F>(max_attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Err(err) if err.is_version_conflict() && attempt < max_attempts => {
                debug!(attempt, max_attempts, error = %err, "version conflict; retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlanError;

    fn conflict() -> PlanError {
        PlanError::VersionConflict {
            item: "P1".parse().unwrap(),
            expected: 0,
            actual: 1,
        }
    }

    #[test]
    fn retries_conflicts_until_success() {
        let mut calls = Vec::new();
        let out = with_conflict_retry(3, |attempt| {
            calls.push(attempt);
            if attempt < 3 { Err(conflict()) } else { Ok(attempt) }
        })
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls, vec![1, 2, 3]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let err = with_conflict_retry::<(), _>(2, |_| {
            calls += 1;
            Err(conflict())
        })
        .unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(calls, 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_conflict_retry::<(), _>(5, |_| {
            calls += 1;
            Err(PlanError::NotFound("P9".into()))
        })
        .unwrap_err();
        assert!(matches!(err, PlanError::NotFound(_)));
        assert_eq!(calls, 1);
    }
}
