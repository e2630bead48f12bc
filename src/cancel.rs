//! Cooperative cancellation for waits and retry backoff.
//!
//! Every sleep in the client goes through [`Cancellation::pause`], so a
//! caller holding the paired [`CancelHandle`] can stop a long wait early.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::ClientError;

/// Sender half used to request cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals every paired [`Cancellation`] to stop at its next pause.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Receiver half observed by in-flight operations.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    receiver: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// Creates a linked handle and token pair.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (sender, receiver) = watch::channel(false);
        (
            CancelHandle { sender },
            Self {
                receiver: Some(receiver),
            },
        )
    }

    /// Returns a token that is never cancelled.
    #[must_use]
    pub const fn never() -> Self {
        Self { receiver: None }
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// A dropped [`CancelHandle`] leaves the sleep running to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Cancelled`] when cancellation is requested
    /// before or during the sleep.
    pub async fn pause(&self, duration: Duration) -> Result<(), ClientError> {
        let Some(mut receiver) = self.receiver.clone() else {
            sleep(duration).await;
            return Ok(());
        };
        if *receiver.borrow_and_update() {
            return Err(ClientError::Cancelled);
        }

        let deadline = sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return Ok(()),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        (&mut deadline).await;
                        return Ok(());
                    }
                    if *receiver.borrow_and_update() {
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn never_token_sleeps_full_duration() {
        let start = Instant::now();
        Cancellation::never()
            .pause(Duration::from_secs(3))
            .await
            .unwrap_or_else(|err| panic!("pause: {err}"));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_returns_before_sleeping() {
        let (handle, token) = Cancellation::pair();
        handle.cancel();
        let start = Instant::now();
        let result = token.pause(Duration::from_secs(30)).await;
        assert_eq!(result, Err(ClientError::Cancelled));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_pause() {
        let (handle, token) = Cancellation::pair();
        let waiter = tokio::spawn(async move { token.pause(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let result = waiter
            .await
            .unwrap_or_else(|err| panic!("join pause task: {err}"));
        assert_eq!(result, Err(ClientError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_lets_pause_complete() {
        let (handle, token) = Cancellation::pair();
        drop(handle);
        let start = Instant::now();
        token
            .pause(Duration::from_secs(2))
            .await
            .unwrap_or_else(|err| panic!("pause: {err}"));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
