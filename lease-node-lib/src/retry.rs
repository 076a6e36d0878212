use blueprint_sdk::{error, warn};
use lease_runtime::error::Result;
use std::future::Future;
use std::time::Duration;

use crate::clock::Clock;

/// Bounded retry with a fixed delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// Intermediate failures are logged as warnings; the final failure is logged
/// once, after the budget is exhausted, and returned.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    clock: &dyn Clock,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                warn!("{label}: attempt {attempt}/{max_attempts} failed: {err}");
                clock.sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!("{label}: all {max_attempts} attempts failed: {err}");
                return Err(err);
            }
        }
    }
}
