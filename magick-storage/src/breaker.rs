//! Circuit breaker for Remote store writes.
//!
//! Closed/open/half-open state machine under a single mutex. A
//! short-circuit or a failed call surfaces as `None`, never as an error:
//! the registry degrades to the remaining tiers and the next successful
//! write heals the Remote copy.

use std::future::Future;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use magick_core::config::BreakerConfig;
use magick_core::error::AdapterError;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Circuit {
    /// Calls flow through.
    Closed,
    /// Calls are rejected until the timeout elapses.
    Open,
    /// The timeout elapsed; the next call probes the backend.
    HalfOpen,
}

struct BreakerState {
    circuit: Circuit,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Closed/open/half-open breaker wrapping Remote store operations.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                circuit: Circuit::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current circuit state, applying the open→half-open transition if
    /// the timeout has elapsed.
    pub fn circuit(&self) -> Circuit {
        let mut state = self.state.lock();
        Self::maybe_half_open(&mut state, &self.config);
        state.circuit
    }

    /// Execute `op` under the breaker. Returns `None` when the circuit
    /// short-circuits the call or the call fails.
    pub async fn call<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        if !self.allow() {
            debug!("circuit open, skipping remote call");
            return None;
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Some(value)
            }
            Err(err) => {
                warn!(error = %err, "remote call failed");
                self.record_failure();
                None
            }
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        Self::maybe_half_open(&mut state, &self.config);
        state.circuit != Circuit::Open
    }

    /// Reset the failure count and close the circuit.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.circuit != Circuit::Closed {
            info!("circuit closing");
        }
        state.circuit = Circuit::Closed;
        state.failures = 0;
        state.opened_at = None;
    }

    /// Count a failure; at the threshold the circuit opens.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        if state.failures >= self.config.threshold && state.circuit != Circuit::Open {
            warn!(failures = state.failures, "circuit opening");
            state.circuit = Circuit::Open;
            state.opened_at = Some(Instant::now());
        } else if state.circuit == Circuit::Open {
            // Failed probe from half-open: restart the open interval.
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failures
    }

    fn maybe_half_open(state: &mut BreakerState, config: &BreakerConfig) {
        if state.circuit != Circuit::Open {
            return;
        }
        let elapsed = state.opened_at.map(|t| t.elapsed() >= config.timeout);
        if elapsed.unwrap_or(true) {
            debug!("circuit transitioning to half-open");
            state.circuit = Circuit::HalfOpen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig { threshold, timeout })
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.circuit(), Circuit::Closed);

        for _ in 0..3 {
            let result: Option<()> = cb
                .call(|| async { Err(AdapterError::Remote("down".into())) })
                .await;
            assert!(result.is_none());
        }
        assert_eq!(cb.circuit(), Circuit::Open);

        // Short-circuits without executing.
        let result = cb.call(|| async { Ok::<_, AdapterError>(1) }).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        let _: Option<()> = cb
            .call(|| async { Err(AdapterError::Remote("down".into())) })
            .await;
        let _: Option<()> = cb
            .call(|| async { Err(AdapterError::Remote("down".into())) })
            .await;
        assert_eq!(cb.failure_count(), 2);

        let result = cb.call(|| async { Ok::<_, AdapterError>(7) }).await;
        assert_eq!(result, Some(7));
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.circuit(), Circuit::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let cb = breaker(1, Duration::from_millis(10));
        let _: Option<()> = cb
            .call(|| async { Err(AdapterError::Remote("down".into())) })
            .await;
        assert_eq!(cb.circuit(), Circuit::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.circuit(), Circuit::HalfOpen);

        let result = cb.call(|| async { Ok::<_, AdapterError>("up") }).await;
        assert_eq!(result, Some("up"));
        assert_eq!(cb.circuit(), Circuit::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_reopens_on_failure() {
        let cb = breaker(1, Duration::from_millis(10));
        let _: Option<()> = cb
            .call(|| async { Err(AdapterError::Remote("down".into())) })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.circuit(), Circuit::HalfOpen);

        let result: Option<()> = cb
            .call(|| async { Err(AdapterError::Remote("still down".into())) })
            .await;
        assert!(result.is_none());
        assert_eq!(cb.circuit(), Circuit::Open);
    }
}
