//! Waiting on many jobs with batched status polling.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;
use crate::transport::Transport;

use super::{Job, JobClient, JobId};

const STATUS_FIELDS: [&str; 2] = ["jid", "status"];

/// Result of [`JobClient::wait_all`].
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOutcome {
    /// Every job finished; full snapshots in request order.
    Complete(Vec<Job>),
    /// The timeout elapsed before every job finished. No partial data is
    /// returned.
    Incomplete,
}

/// Sleep before the next batch poll: `1.0 + min(tries / 10, 9.0)` seconds.
#[must_use]
pub fn batch_sleep(tries: u32) -> Duration {
    let extra_millis = u64::from(tries).saturating_mul(100).min(9_000);
    Duration::from_millis(1_000 + extra_millis)
}

impl<T: Transport> JobClient<T> {
    /// Waits until every job in `jobs` is terminal, then fetches full
    /// details once.
    ///
    /// Each iteration makes one status-only lookup (chunked by
    /// [`super::JOB_FETCH_CHUNK`]) for the jobs still pending.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JobNotFound`] when a requested job is missing
    /// from a response, or any polling error.
    pub async fn wait_all<I, J>(
        &self,
        jobs: I,
        timeout: Option<Duration>,
    ) -> Result<BatchOutcome, ClientError>
    where
        I: IntoIterator<Item = J>,
        J: Into<JobId>,
    {
        let jids: Vec<JobId> = jobs.into_iter().map(Into::into).collect();
        let start = Instant::now();
        let mut pending = jids.clone();
        let mut tries: u32 = 1;

        while !pending.is_empty() {
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Ok(BatchOutcome::Incomplete);
            }

            let snapshots = self.get_many(&pending, &STATUS_FIELDS).await?;
            pending = snapshots
                .into_iter()
                .filter(|job| !job.is_terminal())
                .map(|job| job.jid)
                .collect();

            if !pending.is_empty() {
                tries += 1;
                let delay = batch_sleep(tries);
                debug!(
                    pending = pending.len(),
                    delay_secs = delay.as_secs_f64(),
                    "waiting for job batch"
                );
                self.requester().cancellation().pause(delay).await?;
            }
        }

        self.get_many(&jids, &[]).await.map(BatchOutcome::Complete)
    }
}
