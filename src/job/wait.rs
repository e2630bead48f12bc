//! Polling a single job until it reaches a target status.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;
use crate::transport::Transport;

use super::{Job, JobClient, JobStatus};

/// First sleep between polls.
pub const INITIAL_POLL_PERIOD: Duration = Duration::from_secs(1);
/// Increase applied to the poll period after each poll.
pub const POLL_PERIOD_STEP: Duration = Duration::from_millis(500);
/// Longest sleep between polls.
pub const MAX_POLL_PERIOD: Duration = Duration::from_secs(10);

/// Linear poll backoff: 1.0 s, 1.5 s, 2.0 s, ... capped at 10 s.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSchedule {
    current: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl PollSchedule {
    /// Starts at [`INITIAL_POLL_PERIOD`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: INITIAL_POLL_PERIOD,
        }
    }

    /// Returns the period the next sleep will use.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current period and advances the schedule.
    pub fn advance(&mut self) -> Duration {
        let period = self.current;
        self.current = (self.current + POLL_PERIOD_STEP).min(MAX_POLL_PERIOD);
        period
    }
}

/// Set of job statuses a wait can stop on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatusSet {
    bits: u8,
}

impl StatusSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// `done`, `error`, `killed`, and `stalled`.
    #[must_use]
    pub const fn terminal() -> Self {
        Self::empty()
            .with(JobStatus::Done)
            .with(JobStatus::Error)
            .with(JobStatus::Killed)
            .with(JobStatus::Stalled)
    }

    /// A set holding exactly one status.
    #[must_use]
    pub const fn only(status: JobStatus) -> Self {
        Self::empty().with(status)
    }

    /// Returns the set extended with `status`.
    #[must_use]
    pub const fn with(self, status: JobStatus) -> Self {
        Self {
            bits: self.bits | Self::bit(status),
        }
    }

    /// Returns `true` when `status` is in the set.
    #[must_use]
    pub const fn contains(self, status: JobStatus) -> bool {
        self.bits & Self::bit(status) != 0
    }

    const fn bit(status: JobStatus) -> u8 {
        1 << (status as u8)
    }
}

impl FromIterator<JobStatus> for StatusSet {
    fn from_iter<I: IntoIterator<Item = JobStatus>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Result of [`JobClient::wait`]. A timeout is an ordinary outcome, not an
/// error.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    /// The job reached one of the target statuses.
    Reached(Job),
    /// The timeout elapsed first; holds the last snapshot observed.
    TimedOut(Job),
}

impl WaitOutcome {
    /// Returns the latest snapshot.
    #[must_use]
    pub const fn job(&self) -> &Job {
        match self {
            Self::Reached(job) | Self::TimedOut(job) => job,
        }
    }

    /// Consumes the outcome, returning the latest snapshot.
    #[must_use]
    pub fn into_job(self) -> Job {
        match self {
            Self::Reached(job) | Self::TimedOut(job) => job,
        }
    }

    /// Returns the status reached, or `None` on timeout.
    #[must_use]
    pub const fn reached_status(&self) -> Option<JobStatus> {
        match self {
            Self::Reached(job) => Some(job.status),
            Self::TimedOut(_) => None,
        }
    }
}

impl<T: Transport> JobClient<T> {
    /// Polls `job` until its status is in `target` or `timeout` elapses.
    ///
    /// The timeout is checked before the status, so a zero timeout returns
    /// [`WaitOutcome::TimedOut`] without polling. A job already in `target`
    /// is returned without sleeping.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when a refresh fails or the wait is cancelled.
    pub async fn wait(
        &self,
        job: Job,
        target: StatusSet,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ClientError> {
        let start = Instant::now();
        let mut schedule = PollSchedule::new();
        let mut current = job;
        loop {
            let elapsed = start.elapsed();
            if let Some(limit) = timeout
                && elapsed >= limit
            {
                return Ok(WaitOutcome::TimedOut(current));
            }
            if target.contains(current.status) {
                return Ok(WaitOutcome::Reached(current));
            }

            let period = schedule.advance();
            let delay = timeout.map_or(period, |limit| period.min(limit.saturating_sub(elapsed)));
            debug!(
                jid = %current.jid,
                status = %current.status,
                delay_secs = delay.as_secs_f64(),
                "waiting for job status"
            );
            self.requester().cancellation().pause(delay).await?;
            current = self.refresh(&current).await?;
        }
    }
}
