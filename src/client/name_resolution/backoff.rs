/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::time::Duration;

use rand::Rng;

#[derive(Clone)]
pub(crate) struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a
    /// failed retry. Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// Exponential backoff with jitter, following
/// https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
///
/// Used to space out attempts to re-establish a failed control-plane stream
/// (and, through the connection machinery, failed connections in general).
/// `reset` must be called once an attempt succeeds so the next failure starts
/// over from `base_delay`.
pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter. Store as f64
    /// to avoid rounding errors.
    next_delay_secs: f64,
}

/// The default backoff configuration: 1s initial delay, growing by 1.6x per
/// attempt up to 120s, with each delay perturbed by +/-20%.
pub(crate) const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        // 0 <= base_delay <= max_delay
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        // 1 <= multiplier
        if self.multiplier < 1.0 {
            Err("multiplier must be greater than 1.0")?;
        }
        // 0 <= jitter <= 1
        if self.jitter < 0.0 {
            Err("jitter must be greater than or equal to 0")?;
        }
        if self.jitter > 1.0 {
            Err("jitter must be less than or equal to 1")?
        }
        Ok(())
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        // The default config is a constant that is known to validate.
        ExponentialBackoff {
            next_delay_secs: DEFAULT_EXPONENTIAL_CONFIG.base_delay.as_secs_f64(),
            config: DEFAULT_EXPONENTIAL_CONFIG,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs,
        })
    }

    /// Restarts the progression at `base_delay`.
    pub fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    /// Returns the delay to apply before the next attempt and advances the
    /// progression.
    pub fn backoff_duration(&mut self) -> Duration {
        let next_delay = self.next_delay_secs;
        let cur_delay =
            next_delay * (1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0));
        self.next_delay_secs = self
            .config
            .max_delay
            .as_secs_f64()
            .min(next_delay * self.config.multiplier);
        Duration::from_secs_f64(cur_delay)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffConfig, ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};

    const EPSILON: f64 = 1e-9;

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone()).is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        // base_delay > max_delay.
        assert!(ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(100),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
        })
        .is_err());
        // multiplier < 1.
        assert!(ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 0.5,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
        })
        .is_err());
        // jitter outside [0, 1].
        assert!(ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: -1.0,
            max_delay: Duration::from_secs(10),
        })
        .is_err());
        assert!(ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 2.0,
            max_delay: Duration::from_secs(10),
        })
        .is_err());
    }

    #[test]
    fn progression_caps_and_resets() {
        let config = BackoffConfig {
            multiplier: 2.0,
            jitter: 0.0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        };
        let mut backoff = ExponentialBackoff::new(config).unwrap();
        for _ in 0..2 {
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(4));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(8));
            // Capped to max_delay from here on.
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));
            backoff.reset();
        }
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::default();
        // 0.8 <= duration <= 1.2.
        let duration = backoff.backoff_duration();
        assert!(duration.gt(&Duration::from_secs_f64(0.8 - EPSILON)));
        assert!(duration.lt(&Duration::from_secs_f64(1.2 + EPSILON)));
        // 1.28 <= duration <= 1.92.
        let duration = backoff.backoff_duration();
        assert!(duration.gt(&Duration::from_secs_f64(1.28 - EPSILON)));
        assert!(duration.lt(&Duration::from_secs_f64(1.92 + EPSILON)));
    }
}
