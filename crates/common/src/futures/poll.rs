use std::{
    ops::ControlFlow,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{Error, Result};

const EXPONENTIAL_BACKOFF_MAX_WAIT_DURATION: Duration = Duration::from_secs(60);

/// Polls a fallible future until it breaks or until the wall-clock budget runs out.
///
/// Given a future that returns a [`Result<ControlFlow<O, ()>>`], this function calls the future
/// repeatedly (with some wait period) until the future returns a [`ControlFlow::Break`] or until it
/// returns an [`Err`] in which case the function stops polling and returns the error.
///
/// The future is always evaluated at least once. If it keeps returning [`ControlFlow::Continue`]
/// after `polling_duration` of elapsed time this function returns [`Error::Timeout`] naming
/// `what`; no partial output is produced.
pub async fn poll<F, O>(
    what: &str,
    polling_duration: Duration,
    polling_wait_behavior: PollingWaitBehavior,
    mut future: impl FnMut() -> F,
) -> Result<O>
where
    F: Future<Output = Result<ControlFlow<O, ()>>>,
{
    let start = Instant::now();
    let mut retries = 0u32;

    loop {
        if let ControlFlow::Break(output) = future().await? {
            break Ok(output);
        }

        let elapsed = start.elapsed();
        if elapsed >= polling_duration {
            break Err(Error::Timeout {
                what: what.to_owned(),
                elapsed,
            });
        }

        let next_wait_duration = match polling_wait_behavior {
            PollingWaitBehavior::Constant(duration) => duration,
            PollingWaitBehavior::ExponentialBackoff => {
                Duration::from_secs(2u64.saturating_pow(retries))
                    .min(EXPONENTIAL_BACKOFF_MAX_WAIT_DURATION)
            }
        };
        let next_wait_duration = next_wait_duration.min(polling_duration - elapsed);
        retries = retries.saturating_add(1);

        trace!(what, retries, ?next_wait_duration, "Condition not met yet");
        tokio::time::sleep(next_wait_duration).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollingWaitBehavior {
    Constant(Duration),
    ExponentialBackoff,
}

impl Default for PollingWaitBehavior {
    fn default() -> Self {
        Self::Constant(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_the_output_once_the_condition_holds() {
        let mut calls = 0;

        let output = poll(
            "three calls",
            Duration::from_secs(5),
            PollingWaitBehavior::Constant(Duration::from_millis(1)),
            || {
                calls += 1;
                let current = calls;
                async move {
                    Ok(if current == 3 {
                        ControlFlow::Break(current)
                    } else {
                        ControlFlow::Continue(())
                    })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(output, 3);
    }

    #[tokio::test]
    async fn times_out_without_partial_output() {
        let result = poll::<_, ()>(
            "a condition that never holds",
            Duration::from_millis(30),
            PollingWaitBehavior::Constant(Duration::from_millis(5)),
            || async { Ok(ControlFlow::Continue(())) },
        )
        .await;

        match result {
            Err(Error::Timeout { what, elapsed }) => {
                assert_eq!(what, "a condition that never holds");
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn errors_stop_the_polling_loop() {
        let mut calls = 0;

        let result = poll::<_, ()>(
            "an erroring condition",
            Duration::from_secs(5),
            PollingWaitBehavior::Constant(Duration::from_millis(1)),
            || {
                calls += 1;
                async { Err(Error::configuration("rpc port unknown")) }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn zero_budget_still_evaluates_once() {
        let output = poll(
            "an immediately true condition",
            Duration::ZERO,
            PollingWaitBehavior::default(),
            || async { Ok(ControlFlow::Break("done")) },
        )
        .await
        .unwrap();

        assert_eq!(output, "done");
    }
}
