//! Per-provider health accounting and circuit-breaker arithmetic.

use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff base for degraded providers.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponent ceiling: doublings stop at 2^6.
const BACKOFF_EXP_CAP: u32 = 6;

/// Jitter fraction added on top of the computed backoff.
const BACKOFF_JITTER: f64 = 0.25;

/// Counters driving degradation and restart gating for one provider.
///
/// Transport-level failures advance the circuit (`consecutive_failures`);
/// tool-level invocation failures count against the totals only — a tool
/// returning an error payload is the tool's business outcome, not a sign
/// the provider process is unhealthy.
#[derive(Debug)]
pub struct HealthTracker {
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    total_invocations: u64,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl HealthTracker {
    pub fn new(max_consecutive_failures: u32) -> Self {
        HealthTracker {
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            total_invocations: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes
    }

    pub fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    /// Record a successful operation: resets the consecutive counter.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success_at = Some(Instant::now());
    }

    /// Record a transport-level failure: advances the circuit.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_failure_at = Some(Instant::now());
    }

    /// Record a tool-level invocation failure: totals only.
    pub fn record_invocation_failure(&mut self) {
        self.total_failures += 1;
        self.last_failure_at = Some(Instant::now());
    }

    /// Count one invocation attempt.
    pub fn record_invocation(&mut self) {
        self.total_invocations += 1;
    }

    /// True once consecutive failures reach the configured threshold.
    pub fn should_degrade(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    /// Bounded exponential backoff with jitter, derived from the current
    /// consecutive-failure count.
    pub fn backoff(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = (self.consecutive_failures - 1).min(BACKOFF_EXP_CAP);
        let base = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(exp))
            .min(BACKOFF_MAX);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..BACKOFF_JITTER));
        (base + jitter).min(BACKOFF_MAX)
    }

    /// Whether the backoff window since the last failure has elapsed.
    pub fn can_retry(&self) -> bool {
        match self.last_failure_at {
            None => true,
            Some(at) => at.elapsed() >= self.backoff_floor(),
        }
    }

    /// Seconds until a retry is allowed; zero when retryable now.
    pub fn time_until_retry(&self) -> f64 {
        match self.last_failure_at {
            None => 0.0,
            Some(at) => {
                let floor = self.backoff_floor();
                let elapsed = at.elapsed();
                if elapsed >= floor {
                    0.0
                } else {
                    (floor - elapsed).as_secs_f64()
                }
            }
        }
    }

    /// Deterministic lower bound of the backoff window, used for gating so
    /// repeated `can_retry` polls agree with each other.
    fn backoff_floor(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = (self.consecutive_failures - 1).min(BACKOFF_EXP_CAP);
        BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(exp))
            .min(BACKOFF_MAX)
    }

    /// Counter snapshot for status output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "consecutive_failures": self.consecutive_failures,
            "total_failures": self.total_failures,
            "total_successes": self.total_successes,
            "total_invocations": self.total_invocations,
        })
    }
}
