//! Eventual consistency helpers for timing-dependent tests.
//!
//! Mesh state settles asynchronously: offers, answers and candidates cross
//! the relay and several actor mailboxes before a link reports `Connected`.
//! These helpers poll with exponential backoff on the tokio clock, so they
//! also work under `#[tokio::test(start_paused = true)]`.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Default upper bound for mesh convergence in tests.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_millis(200);

/// Assert that a condition becomes true within `timeout`.
///
/// Uses exponential backoff with the following strategy:
/// - Initial delay: 5ms
/// - Exponential multiplier: 2x, capped at 200ms
/// - Maximum attempts: Until timeout is reached
///
/// # Example
///
/// ```rust,ignore
/// assert_eventually(DEFAULT_SETTLE_TIMEOUT, || async {
///     alice.snapshot().await.is_ok_and(|s| s.connected_count() == 2)
/// })
/// .await
/// .expect("mesh should settle");
/// ```
pub async fn assert_eventually<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met after {attempts} attempts in {elapsed:?} (timeout {timeout:?})"
            ));
        }

        sleep(delay.min(timeout.saturating_sub(elapsed))).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Assert that a condition stays false for the whole of `window`.
///
/// Used for negative checks such as "no offer was sent".
pub async fn assert_never<F, Fut>(window: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < window {
        if condition().await {
            return Err(format!("Condition became true after {:?}", start.elapsed()));
        }
        sleep(INITIAL_DELAY).await;
    }
    Ok(())
}
