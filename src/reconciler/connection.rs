//! Connection lifecycle types for the reconciler

use std::time::Duration;

use rand::Rng;

/// Connection state of a reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; only `online`, `visible` or an explicit
    /// `connect` leave this state
    GaveUp,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any delay, jitter included
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            backoff_multiplier: 1.5,
            jitter: 0.3,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number, without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        self.cap(delay)
    }

    /// Delay for `attempt` with up to `jitter` extra, still capped
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt).as_nanos() as f64;
        if self.jitter <= 0.0 {
            return self.cap(base);
        }
        let factor = rng.gen_range(0.0..=self.jitter);
        self.cap(base * (1.0 + factor))
    }

    /// Whether `attempt` failures exhaust the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }

    fn cap(&self, nanos: f64) -> Duration {
        let max = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }
}
