//! Per-provider admission control: a token bucket in front of a circuit breaker.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::providers::{AdmissionProfile, ProviderKind};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    /// Failure times still inside the window, oldest first.
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    /// One probe admitted at `probe_started`, outcome pending.
    HalfOpen { probe_started: Instant },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    window: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(profile: &AdmissionProfile) -> Self {
        Self {
            state: BreakerState::Closed {
                failures: VecDeque::new(),
            },
            threshold: profile.breaker_threshold.max(1),
            window: profile.failure_window,
            base_cooldown: profile.cooldown,
            max_cooldown: profile.max_cooldown.max(profile.cooldown),
            cooldown: profile.cooldown,
        }
    }

    /// A probe whose outcome never arrived within a cooldown (its caller was
    /// cancelled) no longer blocks the next one.
    fn probe_abandoned(&self, probe_started: Instant, now: Instant) -> bool {
        now.saturating_duration_since(probe_started) >= self.cooldown
    }

    /// Would a call be let through right now? Does not change state.
    fn would_allow(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => now >= until,
            BreakerState::HalfOpen { probe_started } => self.probe_abandoned(probe_started, now),
        }
    }

    /// Commit an admission. An expired cooldown moves to half-open and the
    /// caller becomes the single probe.
    fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen { probe_started: now };
                true
            }
            BreakerState::Open { .. } => false,
            BreakerState::HalfOpen { probe_started } => {
                if !self.probe_abandoned(probe_started, now) {
                    return false;
                }
                tracing::debug!("Replacing abandoned half-open probe");
                self.state = BreakerState::HalfOpen { probe_started: now };
                true
            }
        }
    }

    fn on_success(&mut self) {
        self.cooldown = self.base_cooldown;
        self.state = BreakerState::Closed {
            failures: VecDeque::new(),
        };
    }

    /// Returns true when this failure tripped the breaker.
    fn on_failure(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                while failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
                {
                    failures.pop_front();
                }
                failures.push_back(now);
                if failures.len() >= self.threshold as usize {
                    self.state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                    return true;
                }
                false
            }
            BreakerState::HalfOpen { .. } => {
                self.cooldown = (self.cooldown * 2).min(self.max_cooldown);
                self.state = BreakerState::Open {
                    until: now + self.cooldown,
                };
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    fn circuit_state(&self) -> CircuitState {
        match self.state {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Read-only view of one provider's admission state.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub provider: ProviderKind,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub bucket_capacity: u32,
    pub refill_per_minute: u32,
    pub admitted: u64,
    pub rejected: u64,
}

pub struct AdmissionController {
    provider: ProviderKind,
    profile: AdmissionProfile,
    limiter: DefaultDirectRateLimiter,
    breaker: Mutex<CircuitBreaker>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn for_provider(provider: ProviderKind) -> Self {
        Self::new(provider, provider.profile().admission)
    }

    pub fn new(provider: ProviderKind, profile: AdmissionProfile) -> Self {
        let capacity = NonZeroU32::new(profile.bucket_capacity).unwrap_or(NonZeroU32::MIN);
        let refill = NonZeroU32::new(profile.refill_per_minute).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(refill).allow_burst(capacity);
        Self {
            provider,
            profile,
            limiter: RateLimiter::direct(quota),
            breaker: Mutex::new(CircuitBreaker::new(&profile)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Non-blocking admission. A denied call must not be attempted.
    pub fn try_acquire(&self) -> Result<(), ProviderError> {
        let now = Instant::now();
        let mut breaker = self.lock_breaker();
        if !breaker.would_allow(now) {
            drop(breaker);
            return Err(self.reject(ProviderError::CircuitOpen));
        }
        if self.limiter.check().is_err() {
            drop(breaker);
            return Err(self.reject(ProviderError::RateLimited));
        }
        breaker.allow(now);
        drop(breaker);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait for a token, giving up at `deadline`. An open circuit still fails
    /// immediately.
    pub async fn acquire_blocking(&self, deadline: Instant) -> Result<(), ProviderError> {
        if !self.lock_breaker().would_allow(Instant::now()) {
            return Err(self.reject(ProviderError::CircuitOpen));
        }
        if tokio::time::timeout_at(deadline, self.limiter.until_ready())
            .await
            .is_err()
        {
            return Err(self.reject(ProviderError::RateLimited));
        }
        if !self.lock_breaker().allow(Instant::now()) {
            return Err(self.reject(ProviderError::CircuitOpen));
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_success(&self) {
        self.lock_breaker().on_success();
    }

    pub fn record_failure(&self) {
        let tripped = self.lock_breaker().on_failure(Instant::now());
        if tripped {
            tracing::warn!(provider = %self.provider, "Circuit breaker opened");
            metrics::counter!("discovery_circuit_opened_total", "provider" => self.provider.name())
                .increment(1);
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock_breaker().circuit_state()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let now = Instant::now();
        let breaker = self.lock_breaker();
        let (consecutive_failures, cooldown_remaining_ms) = match breaker.state {
            BreakerState::Closed { ref failures } => (failures.len() as u32, None),
            BreakerState::Open { until } => (
                breaker.threshold,
                Some(until.saturating_duration_since(now).as_millis() as u64),
            ),
            BreakerState::HalfOpen { .. } => (breaker.threshold, None),
        };
        AdmissionSnapshot {
            provider: self.provider,
            circuit: breaker.circuit_state(),
            consecutive_failures,
            cooldown_remaining_ms,
            bucket_capacity: self.profile.bucket_capacity,
            refill_per_minute: self.profile.refill_per_minute,
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, reason: ProviderError) -> ProviderError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let label = match reason {
            ProviderError::CircuitOpen => "circuit_open",
            _ => "rate_limited",
        };
        tracing::debug!(provider = %self.provider, reason = label, "Admission denied");
        metrics::counter!(
            "discovery_admission_rejections_total",
            "provider" => self.provider.name(),
            "reason" => label
        )
        .increment(1);
        reason
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
