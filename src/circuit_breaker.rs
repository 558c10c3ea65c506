use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Breaker type shared by the external HTTP clients.
///
/// Cloning yields a handle to the same state, so every clone of a client
/// trips and recovers together.
pub type ExternalBreaker = failsafe::StateMachine<
    failure_policy::ConsecutiveFailures<backoff::Exponential>,
    (),
>;

/// Creates a circuit breaker for an external API to prevent cascading failures.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, requests fail fast.
/// - **HALF_OPEN**: Testing if service recovered.
///
/// # Example
///
/// ```rust
/// use rust_leads_api::circuit_breaker::create_external_api_breaker;
/// use failsafe::futures::CircuitBreaker;
///
/// let breaker = create_external_api_breaker();
/// // let places = breaker.call(async { client.post(url).send().await }).await;
/// # let _ = breaker;
/// ```
pub fn create_external_api_breaker() -> ExternalBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = create_external_api_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("simulated error"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));

        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected circuit to be open and reject requests"),
        }
    }

    #[test]
    fn test_circuit_breaker_allows_success() {
        let cb = create_external_api_breaker();

        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn clones_share_state() {
        let cb = create_external_api_breaker();
        let other = cb.clone();

        for _ in 0..5 {
            let _: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("boom"));
        }

        assert!(!other.is_call_permitted());
    }
}
