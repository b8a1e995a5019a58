//! Adaptive rate limiting: a limit that shrinks under load and recovers once
//! it passes.
//!
//! [`AdaptiveLimiter`] wraps an [`Algorithm`] and periodically re-derives its
//! effective quota from live CPU/memory pressure plus a rolling window of
//! caller-reported outcomes and latencies. It never blocks a check to sample
//! signals: adaptation only runs at most once per `check_interval`, and the
//! quota in effect for a given request is whatever the last adaptation left
//! it at.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::algorithm::{Algorithm, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, DecisionMetadata};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::Storage;

/// Source of system load signals consulted when deciding whether to adapt.
///
/// Abstracted behind a trait so tests can inject fixed readings instead of
/// depending on the host machine's actual CPU/memory usage.
pub trait SystemSignals: Send + Sync {
    /// Current system-wide CPU usage, as a percentage (0-100).
    fn cpu_percent(&self) -> f64;
    /// Current system-wide memory usage, as a percentage (0-100).
    fn memory_percent(&self) -> f64;
}

/// `SystemSignals` backed by the `sysinfo` crate.
#[cfg(feature = "adaptive")]
pub struct SysinfoSignals {
    system: Mutex<sysinfo::System>,
}

#[cfg(feature = "adaptive")]
impl SysinfoSignals {
    /// Create a new signal source, taking an initial measurement.
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system: Mutex::new(system) }
    }
}

#[cfg(feature = "adaptive")]
impl Default for SysinfoSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "adaptive")]
impl SystemSignals for SysinfoSignals {
    fn cpu_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.global_cpu_usage() as f64
    }

    fn memory_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (system.used_memory() as f64 / total as f64) * 100.0
    }
}

/// Fixed readings, for deterministic tests.
pub struct FixedSignals {
    cpu: Mutex<f64>,
    memory: Mutex<f64>,
}

impl FixedSignals {
    /// Create a fixed signal source.
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu: Mutex::new(cpu_percent),
            memory: Mutex::new(memory_percent),
        }
    }

    /// Update the reported CPU usage.
    pub fn set_cpu(&self, cpu_percent: f64) {
        *self.cpu.lock() = cpu_percent;
    }

    /// Update the reported memory usage.
    pub fn set_memory(&self, memory_percent: f64) {
        *self.memory.lock() = memory_percent;
    }
}

impl SystemSignals for FixedSignals {
    fn cpu_percent(&self) -> f64 {
        *self.cpu.lock()
    }

    fn memory_percent(&self) -> f64 {
        *self.memory.lock()
    }
}

/// Thresholds and tuning constants driving adaptation decisions.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveThresholds {
    /// CPU usage (%) above which the limit is reduced.
    pub cpu_threshold: f64,
    /// Memory usage (%) above which the limit is reduced.
    pub memory_threshold: f64,
    /// Error rate above which the limit is reduced; below half of which it recovers.
    pub error_threshold: f64,
    /// Average latency (seconds) above which the limit is reduced; below half of which it recovers.
    pub latency_threshold: f64,
    /// Multiplier applied to the current limit when reducing.
    pub adaptation_factor: f64,
    /// Multiplier applied to the current limit when recovering.
    pub recovery_factor: f64,
    /// Minimum time between adaptation checks.
    pub check_interval: Duration,
    /// Number of recent outcomes/latencies kept for the rolling average.
    pub window_size: usize,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            error_threshold: 0.10,
            latency_threshold: 1.0,
            adaptation_factor: 0.5,
            recovery_factor: 1.1,
            check_interval: Duration::from_secs(10),
            window_size: 100,
        }
    }
}

/// Point-in-time adaptive limiter statistics.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveMetrics {
    /// The configured ceiling; adaptation never exceeds this.
    pub base_limit: u64,
    /// The limit currently in effect.
    pub current_limit: u64,
    /// Total requests seen since the last full reset.
    pub total_requests: u64,
    /// Total requests reported via `record_error`.
    pub total_errors: u64,
    /// Error rate over the rolling outcome window.
    pub error_rate: f64,
    /// Average latency (seconds) over the rolling latency window.
    pub avg_latency: f64,
    /// Last-sampled CPU usage (%).
    pub cpu_percent: f64,
    /// Last-sampled memory usage (%).
    pub memory_percent: f64,
    /// Number of times the limit has been adapted.
    pub adaptations: u64,
    /// Number of outcomes currently held in the rolling window.
    pub window_samples: usize,
}

struct AdaptiveState {
    current_limit: u64,
    request_results: VecDeque<bool>,
    request_latencies: VecDeque<f64>,
    last_check_ms: u64,
    total_requests: u64,
    total_errors: u64,
    adaptations: u64,
    thresholds: AdaptiveThresholds,
}

/// Rate limiter whose effective quota shrinks under load and recovers once
/// error rate, latency, CPU, and memory settle back down.
pub struct AdaptiveLimiter<A: Algorithm = TokenBucket> {
    algorithm: A,
    clock: Arc<dyn Clock>,
    signals: Arc<dyn SystemSignals>,
    base_limit: u64,
    window: Duration,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveLimiter<TokenBucket> {
    /// Create a new adaptive limiter, starting at `base_limit` requests per `window`.
    #[cfg(feature = "adaptive")]
    pub fn new(base_limit: u64, window: Duration) -> Self {
        Self::with_algorithm(TokenBucket::new(), base_limit, window)
    }
}

impl<A: Algorithm> AdaptiveLimiter<A> {
    /// Create an adaptive limiter driven by a specific algorithm.
    #[cfg(feature = "adaptive")]
    pub fn with_algorithm(algorithm: A, base_limit: u64, window: Duration) -> Self {
        Self {
            algorithm,
            clock: Arc::new(SystemClock),
            signals: Arc::new(SysinfoSignals::new()),
            base_limit,
            window,
            state: Mutex::new(AdaptiveState {
                current_limit: base_limit,
                request_results: VecDeque::with_capacity(AdaptiveThresholds::default().window_size),
                request_latencies: VecDeque::with_capacity(AdaptiveThresholds::default().window_size),
                last_check_ms: 0,
                total_requests: 0,
                total_errors: 0,
                adaptations: 0,
                thresholds: AdaptiveThresholds::default(),
            }),
        }
    }

    /// Create an adaptive limiter with explicit signal source, algorithm, and
    /// clock, bypassing `sysinfo` entirely (used in tests).
    pub fn with_parts(
        algorithm: A,
        base_limit: u64,
        window: Duration,
        clock: Arc<dyn Clock>,
        signals: Arc<dyn SystemSignals>,
    ) -> Self {
        Self {
            algorithm,
            clock,
            signals,
            base_limit,
            window,
            state: Mutex::new(AdaptiveState {
                current_limit: base_limit,
                request_results: VecDeque::with_capacity(AdaptiveThresholds::default().window_size),
                request_latencies: VecDeque::with_capacity(AdaptiveThresholds::default().window_size),
                last_check_ms: 0,
                total_requests: 0,
                total_errors: 0,
                adaptations: 0,
                thresholds: AdaptiveThresholds::default(),
            }),
        }
    }

    /// Replace the tuning thresholds entirely.
    pub fn with_thresholds(self, thresholds: AdaptiveThresholds) -> Self {
        self.state.lock().thresholds = thresholds;
        self
    }

    /// Update individual thresholds, leaving the rest unchanged.
    pub fn set_thresholds(
        &self,
        cpu: Option<f64>,
        memory: Option<f64>,
        error_rate: Option<f64>,
        latency: Option<f64>,
    ) {
        let mut state = self.state.lock();
        if let Some(cpu) = cpu {
            state.thresholds.cpu_threshold = cpu;
        }
        if let Some(memory) = memory {
            state.thresholds.memory_threshold = memory;
        }
        if let Some(error_rate) = error_rate {
            state.thresholds.error_threshold = error_rate;
        }
        if let Some(latency) = latency {
            state.thresholds.latency_threshold = latency;
        }
    }

    fn quota_for_limit(&self, limit: u64) -> Quota {
        Quota::new(limit.max(1), self.window)
    }

    /// Record the outcome (and optionally the latency, in seconds) of a completed request.
    pub fn record_success(&self, latency_secs: Option<f64>) {
        let mut state = self.state.lock();
        let window_size = state.thresholds.window_size;
        push_bounded(&mut state.request_results, true, window_size);
        if let Some(latency) = latency_secs {
            push_bounded(&mut state.request_latencies, latency, window_size);
        }
    }

    /// Record a failed request.
    pub fn record_error(&self, latency_secs: Option<f64>) {
        let mut state = self.state.lock();
        let window_size = state.thresholds.window_size;
        push_bounded(&mut state.request_results, false, window_size);
        state.total_errors += 1;
        if let Some(latency) = latency_secs {
            push_bounded(&mut state.request_latencies, latency, window_size);
        }
    }

    /// Re-evaluate signals and adapt the current limit if `check_interval` has
    /// elapsed since the last adaptation attempt.
    fn maybe_adapt(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let check_interval_ms = state.thresholds.check_interval.as_millis() as u64;
        if now.saturating_sub(state.last_check_ms) < check_interval_ms {
            return;
        }
        state.last_check_ms = now;

        let mut should_reduce = false;
        // Each is `None` until enough samples exist to judge it; increase is
        // conjunctive (every judged signal must be healthy) so recovery can't
        // flap on one improving metric while another is still degraded.
        let mut error_healthy: Option<bool> = None;
        let mut latency_healthy: Option<bool> = None;

        if self.signals.cpu_percent() > state.thresholds.cpu_threshold {
            should_reduce = true;
        }
        if self.signals.memory_percent() > state.thresholds.memory_threshold {
            should_reduce = true;
        }

        if state.request_results.len() >= 10 {
            let error_count = state.request_results.iter().filter(|ok| !**ok).count();
            let error_rate = error_count as f64 / state.request_results.len() as f64;
            if error_rate > state.thresholds.error_threshold {
                should_reduce = true;
            }
            error_healthy = Some(error_rate < state.thresholds.error_threshold / 2.0);
        }

        if state.request_latencies.len() >= 10 {
            let avg_latency: f64 =
                state.request_latencies.iter().sum::<f64>() / state.request_latencies.len() as f64;
            if avg_latency > state.thresholds.latency_threshold {
                should_reduce = true;
            }
            latency_healthy = Some(avg_latency < state.thresholds.latency_threshold / 2.0);
        }

        let should_increase = match (error_healthy, latency_healthy) {
            (Some(e), Some(l)) => e && l,
            (Some(e), None) => e,
            (None, Some(l)) => l,
            (None, None) => false,
        };

        let floor = ((self.base_limit as f64 * 0.1) as u64).max(1);
        if should_reduce && state.current_limit > floor {
            let new_limit = ((state.current_limit as f64 * state.thresholds.adaptation_factor) as u64).max(floor);
            state.current_limit = new_limit;
            state.adaptations += 1;
        } else if should_increase && state.current_limit < self.base_limit {
            let new_limit = ((state.current_limit as f64 * state.thresholds.recovery_factor) as u64)
                .min(self.base_limit);
            state.current_limit = new_limit;
            state.adaptations += 1;
        }
    }

    /// Check and, if allowed, record a request of `weight` against the
    /// currently-adapted quota.
    pub async fn check_and_record<S: Storage>(&self, storage: &S, key: &str, weight: u64) -> Result<Decision> {
        self.maybe_adapt();
        let current_limit = {
            let mut state = self.state.lock();
            state.total_requests += 1;
            state.current_limit
        };
        let quota = self.quota_for_limit(current_limit);
        let decision = self.algorithm.check_and_record(storage, key, &quota, weight).await?;
        Ok(self.annotate(decision, current_limit))
    }

    /// Peek at the current state without recording anything or sampling signals.
    pub async fn check<S: Storage>(&self, storage: &S, key: &str, weight: u64) -> Result<Decision> {
        let current_limit = self.state.lock().current_limit;
        let quota = self.quota_for_limit(current_limit);
        let decision = self.algorithm.check(storage, key, &quota, weight).await?;
        Ok(self.annotate(decision, current_limit))
    }

    fn annotate(&self, decision: Decision, current_limit: u64) -> Decision {
        let adaptations = self.state.lock().adaptations;
        let metadata = DecisionMetadata::new()
            .with_extra("adaptive", true)
            .with_extra("base_limit", self.base_limit)
            .with_extra("current_limit", current_limit)
            .with_extra("adaptations", adaptations);
        let allowed = decision.is_allowed();
        let info = decision.into_info().with_metadata(metadata);
        if allowed {
            Decision::allowed(info)
        } else {
            Decision::denied(info)
        }
    }

    /// Reset the underlying algorithm's state for `key`, without touching
    /// the rolling outcome/latency windows or the current limit.
    pub async fn reset<S: Storage>(&self, storage: &S, key: &str) -> Result<()> {
        self.algorithm.reset(storage, key).await
    }

    /// Clear all rolling statistics and return the limit to `base_limit`.
    pub fn reset_adaptive_state(&self) {
        let mut state = self.state.lock();
        state.request_results.clear();
        state.request_latencies.clear();
        state.current_limit = self.base_limit;
        state.total_requests = 0;
        state.total_errors = 0;
    }

    /// Snapshot of current adaptive statistics.
    pub fn metrics(&self) -> AdaptiveMetrics {
        let state = self.state.lock();
        let error_rate = if state.request_results.is_empty() {
            0.0
        } else {
            let error_count = state.request_results.iter().filter(|ok| !**ok).count();
            error_count as f64 / state.request_results.len() as f64
        };
        let avg_latency = if state.request_latencies.is_empty() {
            0.0
        } else {
            state.request_latencies.iter().sum::<f64>() / state.request_latencies.len() as f64
        };

        AdaptiveMetrics {
            base_limit: self.base_limit,
            current_limit: state.current_limit,
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            error_rate,
            avg_latency,
            cpu_percent: self.signals.cpu_percent(),
            memory_percent: self.signals.memory_percent(),
            adaptations: state.adaptations,
            window_samples: state.request_results.len(),
        }
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, max_len: usize) {
    buf.push_back(value);
    while buf.len() > max_len {
        buf.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn limiter_with(
        clock: Arc<ManualClock>,
        signals: Arc<FixedSignals>,
        base_limit: u64,
    ) -> AdaptiveLimiter<TokenBucket> {
        AdaptiveLimiter::with_parts(
            TokenBucket::with_clock(clock.clone()),
            base_limit,
            Duration::from_secs(60),
            clock,
            signals,
        )
        .with_thresholds(AdaptiveThresholds {
            check_interval: Duration::from_secs(1),
            ..AdaptiveThresholds::default()
        })
    }

    #[tokio::test]
    async fn test_adaptive_limiter_starts_at_base_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(10.0, 10.0));
        let limiter = limiter_with(clock, signals, 100);

        assert_eq!(limiter.metrics().current_limit, 100);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_reduces_under_high_cpu() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(95.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 100);
        let storage = MemoryStorage::new();

        clock.advance(2_000);
        limiter.check_and_record(&storage, "user:1", 1).await.unwrap();

        let metrics = limiter.metrics();
        assert_eq!(metrics.current_limit, 50);
        assert_eq!(metrics.adaptations, 1);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_does_not_reduce_below_floor() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(95.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 10);
        let storage = MemoryStorage::new();

        for _ in 0..10 {
            clock.advance(2_000);
            limiter.check_and_record(&storage, "user:1", 1).await.unwrap();
        }

        assert!(limiter.metrics().current_limit >= 1);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_recovers_on_low_error_rate() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(10.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 100);
        let storage = MemoryStorage::new();

        limiter.reset_adaptive_state();
        {
            let mut state = limiter.state.lock();
            state.current_limit = 50;
        }
        for _ in 0..20 {
            limiter.record_success(None);
        }

        clock.advance(2_000);
        limiter.check_and_record(&storage, "user:1", 1).await.unwrap();

        assert!(limiter.metrics().current_limit > 50);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_reduces_on_high_error_rate() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(10.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 100);
        let storage = MemoryStorage::new();

        for _ in 0..20 {
            limiter.record_error(None);
        }

        clock.advance(2_000);
        limiter.check_and_record(&storage, "user:1", 1).await.unwrap();

        assert_eq!(limiter.metrics().current_limit, 50);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_no_adaptation_before_check_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(95.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 100);
        let storage = MemoryStorage::new();

        clock.advance(500);
        limiter.check_and_record(&storage, "user:1", 1).await.unwrap();

        assert_eq!(limiter.metrics().current_limit, 100);
    }

    #[tokio::test]
    async fn test_adaptive_limiter_reset_adaptive_state_restores_base() {
        let clock = Arc::new(ManualClock::new(0));
        let signals = Arc::new(FixedSignals::new(95.0, 10.0));
        let limiter = limiter_with(clock.clone(), signals, 100);
        let storage = MemoryStorage::new();

        clock.advance(2_000);
        limiter.check_and_record(&storage, "user:1", 1).await.unwrap();
        assert_eq!(limiter.metrics().current_limit, 50);

        limiter.reset_adaptive_state();
        assert_eq!(limiter.metrics().current_limit, 100);
        assert_eq!(limiter.metrics().total_requests, 0);
    }

    #[test]
    fn test_fixed_signals() {
        let signals = FixedSignals::new(42.0, 55.0);
        assert_eq!(signals.cpu_percent(), 42.0);
        assert_eq!(signals.memory_percent(), 55.0);
        signals.set_cpu(10.0);
        assert_eq!(signals.cpu_percent(), 10.0);
    }
}
