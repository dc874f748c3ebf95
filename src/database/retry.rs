//! Retry helpers for job state persistence.
//!
//! All three completer variants funnel their executor calls through
//! [`with_executor_retries`]; terminal-vs-transient classification lives in
//! [`Error::is_terminal`] and nowhere else.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Maximum executor invocations per logical call.
pub const MAX_ATTEMPTS: usize = 10;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;

/// Delay before the attempt following `attempt` (1-based): exponential from
/// 100ms, doubling per attempt, capped at 5s, with ±10% jitter.
fn backoff_delay(attempt: usize) -> Duration {
    let shift = (attempt - 1).min(62) as u32;
    let exp_ms = BASE_DELAY_MS.saturating_mul(1u64 << shift);
    let capped_ms = exp_ms.min(MAX_DELAY_MS);
    let jitter = 0.9 + random::<f64>() * 0.2;
    Duration::from_millis((capped_ms as f64 * jitter) as u64)
}

/// Run `op` until it succeeds, fails terminally, or exhausts
/// [`MAX_ATTEMPTS`]. Backoff sleeps race the cancellation token;
/// `disable_sleep` suppresses them entirely for tests.
pub async fn with_executor_retries<T, F, Fut>(
    cancel: &CancellationToken,
    disable_sleep: bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_terminal() || attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }

                let delay = backoff_delay(attempt);
                warn!(
                    "Job state update failed, retrying in {:?} (attempt {}/{}): {}",
                    delay, attempt, MAX_ATTEMPTS, err
                );

                if !disable_sleep {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Canceled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
