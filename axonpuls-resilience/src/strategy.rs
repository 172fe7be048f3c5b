use rand::Rng;
use serde::{Deserialize, Serialize};

/// A named retry strategy with its parameters, carried on every retry
/// operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        base_delay_ms: u64,
    },
    Linear {
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    Adaptive {
        base_delay_ms: u64,
        max_delay_ms: u64,
        min_delay_ms: u64,
        error_rate_weight: f64,
        load_weight: f64,
        max_load_multiplier: f64,
    },
}

impl RetryStrategy {
    /// Convenience constructor matching the defaults named in the
    /// configuration table: 3 attempts, 200ms base, 30s cap, 2x multiplier.
    pub fn default_exponential() -> Self {
        RetryStrategy::Exponential {
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }

    /// Computes the delay before the next attempt, given the 1-based
    /// attempt number that just failed. `recent_error_rate` (0.0-1.0) and
    /// `load_factor` (count of concurrently active retry operations) are
    /// only consulted by the `Adaptive` strategy.
    pub fn delay_ms(&self, attempt: u32, recent_error_rate: f64, load_factor: usize) -> u64 {
        let raw = match self {
            RetryStrategy::Fixed { base_delay_ms } => *base_delay_ms as f64,
            RetryStrategy::Linear {
                base_delay_ms,
                max_delay_ms,
            } => (*base_delay_ms as f64 * attempt as f64).min(*max_delay_ms as f64),
            RetryStrategy::Exponential {
                base_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exp = (attempt as i32 - 1).max(0);
                (*base_delay_ms as f64 * multiplier.powi(exp)).min(*max_delay_ms as f64)
            }
            RetryStrategy::Adaptive {
                base_delay_ms,
                max_delay_ms,
                min_delay_ms,
                error_rate_weight,
                load_weight,
                max_load_multiplier,
            } => {
                let exp = (attempt as i32 - 1).max(0);
                let base = *base_delay_ms as f64 * 1.5_f64.powi(exp);
                let error_component = 1.0 + recent_error_rate.clamp(0.0, 1.0) * error_rate_weight;
                let load_multiplier = (1.0 + load_factor as f64 * load_weight)
                    .min(*max_load_multiplier)
                    .max(1.0);
                let computed = base * error_component * load_multiplier;
                computed.min(*max_delay_ms as f64).max(*min_delay_ms as f64)
            }
        };
        raw.trunc() as u64
    }

    /// Applies symmetric jitter: `delay * (1 + (rand()-0.5) * 2 * jitter_range)`.
    pub fn apply_jitter(delay_ms: u64, jitter_range: f64) -> u64 {
        if jitter_range <= 0.0 {
            return delay_ms;
        }
        let factor = 1.0 + (rand::thread_rng().gen::<f64>() - 0.5) * 2.0 * jitter_range;
        ((delay_ms as f64 * factor).max(0.0)).trunc() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_is_constant() {
        let s = RetryStrategy::Fixed { base_delay_ms: 500 };
        assert_eq!(s.delay_ms(1, 0.0, 0), 500);
        assert_eq!(s.delay_ms(5, 0.0, 0), 500);
    }

    #[test]
    fn linear_strategy_scales_and_caps() {
        let s = RetryStrategy::Linear {
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        assert_eq!(s.delay_ms(1, 0.0, 0), 100);
        assert_eq!(s.delay_ms(2, 0.0, 0), 200);
        assert_eq!(s.delay_ms(3, 0.0, 0), 250);
    }

    #[test]
    fn exponential_strategy_doubles_and_caps() {
        let s = RetryStrategy::Exponential {
            base_delay_ms: 100,
            max_delay_ms: 700,
            multiplier: 2.0,
        };
        assert_eq!(s.delay_ms(1, 0.0, 0), 100);
        assert_eq!(s.delay_ms(2, 0.0, 0), 200);
        assert_eq!(s.delay_ms(3, 0.0, 0), 400);
        assert_eq!(s.delay_ms(4, 0.0, 0), 700); // 800 capped at 700
    }

    #[test]
    fn adaptive_strategy_grows_with_error_rate_and_load() {
        let s = RetryStrategy::Adaptive {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            min_delay_ms: 50,
            error_rate_weight: 1.0,
            load_weight: 0.1,
            max_load_multiplier: 3.0,
        };
        let quiet = s.delay_ms(1, 0.0, 0);
        let busy = s.delay_ms(1, 1.0, 20);
        assert!(busy > quiet, "busy={busy} quiet={quiet}");
        assert!(s.delay_ms(1, 0.0, 0) >= 50);
    }

    #[test]
    fn jitter_stays_within_expected_bound() {
        for _ in 0..20 {
            let jittered = RetryStrategy::apply_jitter(1000, 0.5);
            assert!(jittered <= 1500 && jittered >= 500, "{jittered}");
        }
    }
}
