use std::{future::Future, time::Duration};

use crate::decay::ExpDecay;

/// Runs `operation` until it succeeds or `max_attempts` attempts fail, sleeping for the next
/// duration of `decay` between attempts. The final error is returned.
pub async fn async_retry_n<O, R, E, F>(
    max_attempts: usize,
    mut decay: ExpDecay,
    operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(decay.next_duration()).await;
            }
        }
    }
}

/// [async_retry_n] with a constant delay.
pub async fn async_retry_n_constant<O, R, E, F>(
    max_attempts: usize,
    delay: Duration,
    operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
{
    async_retry_n(max_attempts, ExpDecay::constant(delay), operation).await
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{async_retry_n, async_retry_n_constant};
    use crate::decay::ExpDecay;

    #[tokio::test]
    async fn completes_successfully_first_time() {
        let value: Result<&str, &str> =
            async_retry_n_constant(2, Duration::from_nanos(1), |attempt| async move {
                assert_eq!(attempt, 1);
                Ok("success")
            })
            .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn completes_successfully_after_failures() {
        let decay = ExpDecay::quadratic(Duration::from_nanos(1), Duration::from_micros(1));
        let value: Result<&str, &str> = async_retry_n(3, decay, |attempt| async move {
            match attempt {
                1 | 2 => Err("forced retry"),
                3 => Ok("success"),
                _ => panic!("too many retry attempts"),
            }
        })
        .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn errors_after_attempts_exhausted() {
        let value: Result<&str, &str> =
            async_retry_n_constant(2, Duration::from_nanos(1), |attempt| async move {
                match attempt {
                    1 => Err("forced retry 1"),
                    2 => Err("forced retry 2"),
                    _ => panic!("too many retry attempts"),
                }
            })
            .await;

        assert_eq!(value, Err("forced retry 2"));
    }
}
