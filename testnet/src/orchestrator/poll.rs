// File: testnet/src/orchestrator/poll.rs
//
// Deadline-bounded polling
//
// Readiness, bootstrap finality and block waits all share one shape: run a
// check, sleep, re-check the deadline. `poll_until` owns that loop; call sites
// only supply the check.

use std::future::Future;
use tokio::time::Duration;

use super::clock::Clock;
use crate::error::TestnetError;

/// Stand-in deadline for budgets too large to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Outcome of one check inside [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T, S> {
    /// The predicate holds; polling stops with this value.
    Ready(T),
    /// Not yet; `S` is the observation reported if the deadline expires.
    Pending(S),
}

/// Interval and overall budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Pause between two checks.
    pub interval: Duration,
    /// Total time budget, including time spent inside checks.
    pub deadline: Duration,
}

impl PollSchedule {
    /// Creates a schedule.
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// The deadline expired before the predicate held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTimeout<S> {
    /// Time spent polling.
    pub elapsed: Duration,
    /// Number of checks started.
    pub attempts: u32,
    /// Last pending observation, if any check completed.
    pub last: Option<S>,
}

impl<S> PollTimeout<S> {
    /// Converts into a [`TestnetError::Timeout`] describing what was awaited.
    pub fn into_error(self, what: impl Into<String>) -> TestnetError {
        TestnetError::Timeout {
            what: what.into(),
            elapsed: self.elapsed,
        }
    }
}

/// Repeatedly runs `check` until it reports [`Probe::Ready`] or the deadline
/// expires.
///
/// A check that is still running when the deadline passes is dropped, so a
/// hung endpoint can never stall the caller beyond `schedule.deadline`. The
/// first check always runs, even with a zero deadline.
///
/// # Example
///
/// ```rust,ignore
/// let info = poll_until(clock.as_ref(), schedule, || async {
///     match api.ledger_info().await {
///         Ok(info) if info.block_height >= target => Probe::Ready(info),
///         Ok(info) => Probe::Pending(info.block_height),
///         Err(_) => Probe::Pending(0),
///     }
/// })
/// .await
/// .map_err(|t| t.into_error("block height"))?;
/// ```
pub async fn poll_until<T, S, F, Fut>(
    clock: &dyn Clock,
    schedule: PollSchedule,
    mut check: F,
) -> Result<T, PollTimeout<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T, S>>,
{
    let start = clock.now();
    let deadline = start
        .checked_add(schedule.deadline)
        .unwrap_or_else(|| start + FAR_FUTURE);
    let mut attempts = 0u32;
    let mut last = None;

    loop {
        let remaining = deadline.saturating_duration_since(clock.now());
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            probe = check() => Some(probe),
            _ = clock.sleep(remaining) => None,
        };

        match outcome {
            Some(Probe::Ready(value)) => return Ok(value),
            Some(Probe::Pending(observation)) => last = Some(observation),
            None => break,
        }

        let now = clock.now();
        if now >= deadline {
            break;
        }
        clock
            .sleep(schedule.interval.min(deadline - now))
            .await;
        if clock.now() >= deadline {
            // One last look at the deadline boundary is not worth a new check.
            break;
        }
    }

    Err(PollTimeout {
        elapsed: clock.now() - start,
        attempts,
        last,
    })
}
