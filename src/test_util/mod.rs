//! This module contains utilities for testing code built on [crate::transport::Transport]. They
//!  are used for testing this crate's carriers, but they are also exported so that other carriers
//!  and applications can run the same scenarios.
//!
//! There are macros in this test utilities, and Rust does not provide a way to reference a type T
//!  from a macro that works both in the crate defining T, and a third party crate. Making test
//!  utilities part of the crate's regular (non-#[cfg(test)]) code is the compromise I picked.

pub mod scenarios;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;


/// Receives the next event from an end point and matches it against a pattern, evaluating to the
///  expression after `=>`. Any other event makes the surrounding function return an error, so
///  this can only be used in functions returning `anyhow::Result`.
#[macro_export]
macro_rules! expect_event {
    ($end_point:expr, $pattern:pat $(if $guard:expr)? => $result:expr) => {{
        match $end_point.receive().await {
            $pattern $(if $guard)? => $result,
            other => ::anyhow::bail!("{:?}: expected {}, got {:?}", $end_point.address(), stringify!($pattern), other),
        }
    }};
}


/// How a scenario run by [run_with_deadline] failed. A timeout is reported separately from
///  failed expectations because it usually points to a hang (e.g. a lost event) rather than a
///  wrong value.
#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error("scenario did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("scenario failed: {0}")]
    Failed(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub num_pings: usize,
    pub deadline: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            num_pings: 1000,
            deadline: Duration::from_secs(1),
        }
    }
}

/// Runs a scenario with an overall wall clock deadline.
pub async fn run_with_deadline<T>(deadline: Duration, scenario: impl Future<Output = anyhow::Result<T>>) -> Result<T, ScenarioFailure> {
    match tokio::time::timeout(deadline, scenario).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ScenarioFailure::TimedOut(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let result = run_with_deadline(Duration::from_secs(1), async {
            std::future::pending::<()>().await;
            Ok(())
        }).await;

        assert!(matches!(result, Err(ScenarioFailure::TimedOut(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_a_timeout() {
        let result = run_with_deadline(Duration::from_secs(1), async {
            anyhow::ensure!(1 + 1 == 3, "arithmetic is broken");
            Ok(())
        }).await;

        assert!(matches!(result, Err(ScenarioFailure::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success() {
        let result = run_with_deadline(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_millis(999)).await;
            Ok(5)
        }).await;

        assert_eq!(result.unwrap(), 5);
    }
}
