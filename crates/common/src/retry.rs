use std::time::Duration;

/// Retry a function with exponential backoff
///
/// # Arguments
/// * `f` - The function to retry
/// * `max_retries` - Maximum number of attempts (at least one attempt is made)
/// * `base_delay_ms` - Initial delay in milliseconds (doubles each retry)
/// * `operation_name` - Human-readable name for logging
pub fn retry_with_backoff<F, T, E>(
    mut f: F,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    retry_while(&mut f, |_| true, max_retries, base_delay_ms, operation_name)
}

/// Like [`retry_with_backoff`], but stops early when `retryable` rejects an error.
pub fn retry_while<F, T, E, P>(
    mut f: F,
    retryable: P,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = max_retries.max(1);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < attempts && retryable(&e) => {
                let delay_ms = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
                    operation_name,
                    attempt + 1,
                    attempts,
                    e,
                    delay_ms
                );
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    attempt + 1,
                    e
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_with_backoff(
            || {
                calls += 1;
                if calls < 3 { Err("busy".into()) } else { Ok(calls) }
            },
            5,
            1,
            "test",
        );
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(
            || {
                calls += 1;
                Err("gone".into())
            },
            3,
            1,
            "test",
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let mut calls = 0;
        let _: Result<(), String> = retry_with_backoff(
            || {
                calls += 1;
                Err("nope".into())
            },
            0,
            1,
            "test",
        );
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let mut calls = 0;
        let result: Result<(), String> = retry_while(
            || {
                calls += 1;
                Err("fatal".into())
            },
            |e| e != "fatal",
            5,
            1,
            "test",
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
