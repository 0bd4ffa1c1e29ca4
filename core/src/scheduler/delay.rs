// Release delay policy: resistance to deposit/payout timing correlation
//
// A payout that follows its deposit by a short or predictable interval can
// be linked across the pool by timing alone. Requested delays must fall
// inside the configured window; generated delays are drawn at random and
// clamped into it.

use crate::error::{MixerError, Result};
use crate::util::time::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distribution type for generated delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterDistribution {
    /// Uniform random distribution
    Uniform,
    /// Exponential distribution (more likely to be small delays)
    Exponential,
}

/// Range and shape of randomly generated delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Minimum delay in milliseconds
    pub min_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Distribution type for jitter
    pub distribution: JitterDistribution,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 30 * 60 * 1_000,
            max_delay_ms: 6 * 60 * 60 * 1_000,
            distribution: JitterDistribution::Uniform,
        }
    }
}

impl JitterConfig {
    /// Validate jitter configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(MixerError::Configuration(
                "jitter min_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        if self.max_delay_ms == 0 {
            return Err(MixerError::Configuration(
                "jitter max_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Draw a random delay from `config`.
pub fn compute_jitter(config: &JitterConfig) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let span = config.max_delay_ms - config.min_delay_ms;
    let delay_ms = match config.distribution {
        JitterDistribution::Uniform => rng.gen_range(config.min_delay_ms..=config.max_delay_ms),
        JitterDistribution::Exponential => {
            // Mean at a fifth of the span, long tail capped at the maximum
            let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
            let scaled = (-uniform.ln() * span as f64 / 5.0) as u64;
            config.min_delay_ms + scaled.min(span)
        }
    };
    Duration::from_millis(delay_ms)
}

/// Hard bounds on how long a release is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl DelayPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Result<Self> {
        if min_delay > max_delay {
            return Err(MixerError::Configuration(
                "scheduler min_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(Self {
            min_delay,
            max_delay,
        })
    }

    /// Accept a caller-requested delay or fail with a scheduling error.
    ///
    /// `allow_zero` admits an immediate release (consolidation only).
    pub fn check_requested(&self, delay: Duration, allow_zero: bool) -> Result<Duration> {
        if allow_zero && delay.is_zero() {
            return Ok(delay);
        }
        if delay < self.min_delay {
            return Err(MixerError::Scheduling(format!(
                "delay {}ms is below the minimum of {}ms",
                duration_ms(delay),
                duration_ms(self.min_delay)
            )));
        }
        if delay > self.max_delay {
            return Err(MixerError::Scheduling(format!(
                "delay {}ms exceeds the maximum of {}ms",
                duration_ms(delay),
                duration_ms(self.max_delay)
            )));
        }
        Ok(delay)
    }

    /// Pull a generated delay into the allowed window.
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.min_delay, self.max_delay)
    }
}
