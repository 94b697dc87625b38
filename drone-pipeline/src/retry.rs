/// Bounded retry with parameter transformation between attempts
use crate::error::{PipelineError, Result};
use log::warn;

/// Run `attempt` with `initial`, deriving new parameters after every failure.
/// `transform` returns `None` to stop early; the last failure is reported as
/// [`PipelineError::RetryExhausted`].
pub fn retry_with_backoff<P, T, A, F>(
    context: &str,
    initial: P,
    mut attempt: A,
    mut transform: F,
    max_attempts: usize,
) -> Result<T>
where
    A: FnMut(&P) -> Result<T>,
    F: FnMut(&P) -> Option<P>,
{
    let mut params = initial;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt(&params) {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{context}: attempt {attempts} failed: {e}");
                if attempts >= max_attempts {
                    break;
                }
                match transform(&params) {
                    Some(next) => params = next,
                    None => break,
                }
            }
        }
    }

    Err(PipelineError::RetryExhausted {
        context: context.to_string(),
        attempts,
    })
}

/// Next thread count after a failure, halving down to a floor of one.
pub fn halve_threads(threads: &usize) -> Option<usize> {
    let next = threads / 2;
    (next >= 1).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halving_sequence_stops_at_one() {
        let mut seen = vec![8usize];
        while let Some(next) = halve_threads(seen.last().unwrap()) {
            seen.push(next);
        }
        assert_eq!(seen, vec![8, 4, 2, 1]);
    }

    #[test]
    fn succeeds_once_params_are_small_enough() {
        let mut tried = Vec::new();
        let result = retry_with_backoff(
            "poisson",
            16usize,
            |threads| {
                tried.push(*threads);
                if *threads <= 4 {
                    Ok(*threads)
                } else {
                    Err(PipelineError::ExternalTool {
                        program: "PoissonRecon".into(),
                        status: -2,
                    })
                }
            },
            halve_threads,
            10,
        );
        assert_eq!(result.unwrap(), 4);
        assert_eq!(tried, vec![16, 8, 4]);
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let err = retry_with_backoff(
            "dem2mesh",
            4usize,
            |_| -> Result<()> { Err(PipelineError::Cancelled) },
            halve_threads,
            10,
        )
        .unwrap_err();

        match err {
            PipelineError::RetryExhausted { context, attempts } => {
                assert_eq!(context, "dem2mesh");
                // 4, 2, 1 then halving yields nothing
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn max_attempts_caps_the_loop() {
        let mut calls = 0;
        let _ = retry_with_backoff(
            "bounded",
            0u32,
            |_| -> Result<()> {
                calls += 1;
                Err(PipelineError::Cancelled)
            },
            |p| Some(p + 1),
            2,
        );
        assert_eq!(calls, 2);
    }
}
