//! Retry configuration for the writer's election loop.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, applied between lost elections.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration.
    pub initial: Duration,
    /// Maximum backoff duration.
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Backoff duration for a given retry count, jittered to 50–150%
    /// so competing proposers desynchronize.
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        let jitter = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig::default();
        let mut rng = rand::rng();

        for _ in 0..100 {
            let first = config.duration(0, &mut rng);
            assert!(first >= Duration::from_millis(5));
            assert!(first <= Duration::from_millis(15));

            let capped = config.duration(20, &mut rng);
            assert!(capped <= Duration::from_millis(1500));
        }
    }
}
