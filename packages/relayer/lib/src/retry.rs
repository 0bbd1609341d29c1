//! Bounded retry of remote chain queries.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainEndpoint, ChainProvider, Height},
    error::RelayerError,
};

/// Default number of attempts per remote operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay between two attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retries a fallible operation a bounded number of times with a fixed delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, the attempts are exhausted or `cancel` fires.
    ///
    /// # Errors
    /// Returns [`RelayerError::Network`] carrying the error of the last attempt, or
    /// [`RelayerError::Cancelled`] as soon as the token is cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, RelayerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayerError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = format!("{err:#}"),
                    "Giving up after the last attempt"
                );
                return Err(RelayerError::Network {
                    operation: operation.to_string(),
                    attempts: attempt,
                    cause: err,
                });
            }

            tracing::info!(
                operation,
                attempt,
                max_attempts,
                error = format!("{err:#}"),
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayerError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

/// Query the latest heights of both chains and step each back by one block.
///
/// The block at the reported latest height may not be committed yet, so every state query
/// against "the latest height" uses the returned heights.
///
/// # Errors
/// Returns an error if either height cannot be queried within the retry budget.
pub async fn query_latest_heights<P: ChainProvider>(
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    src: &ChainEndpoint<P>,
    dst: &ChainEndpoint<P>,
) -> Result<(Height, Height), RelayerError> {
    let (src_provider, dst_provider) = (src.provider(), dst.provider());
    let (src_height, dst_height) = retry
        .run(cancel, "query latest heights", || async move {
            futures::try_join!(
                src_provider.query_latest_height(),
                dst_provider.query_latest_height()
            )
        })
        .await?;

    Ok((src_height.decrement(), dst_height.decrement()))
}
