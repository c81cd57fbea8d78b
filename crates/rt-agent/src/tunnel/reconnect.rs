//! Delay between reconnection attempts

use std::time::Duration;

use rt_core::{BackoffConfig, TunnelConfig};

/// Lower bound on any reconnect delay, whatever the configuration says.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// How long to wait before the next attempt
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// Same delay every time
    Fixed(Duration),
    /// Growing delay, reset after a successful connection
    Exponential(ExponentialBackoff),
}

impl ReconnectPolicy {
    /// Fixed `reconnect_delay`, or exponential backoff when configured
    pub fn from_config(config: &TunnelConfig) -> Self {
        match &config.backoff {
            Some(backoff) => Self::Exponential(ExponentialBackoff::from_config(backoff)),
            None => Self::Fixed(config.reconnect_delay),
        }
    }

    /// Get the next delay and advance the policy
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential(backoff) => backoff.next_delay(),
        };
        delay.max(MIN_RECONNECT_DELAY)
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        if let Self::Exponential(backoff) = self {
            backoff.reset();
        }
    }
}

/// Exponential backoff with jitter for reconnection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay, restored by `reset`
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Overflow saturates at the cap.
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay.saturating_add(Duration::try_from_secs_f64(jitter_amount).unwrap_or(Duration::ZERO))
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
