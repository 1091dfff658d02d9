//! Target-tracking evaluation.
//!
//! `evaluate` is pure: it takes the policy, the cooldown bookkeeping, the
//! current desired count and the sampled metric, and returns a decision.
//! The caller applies a `ScaleTo` under the service lock and then calls
//! [`ScaleState::record_write`].

use std::fmt;

use tracing::debug;

use shoal_state::ScalingPolicy;

use crate::metric::MetricUnavailable;

/// Direction of a desired-count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Out,
    In,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Out => f.write_str("out"),
            ScaleDirection::In => f.write_str("in"),
        }
    }
}

/// Outcome of one evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    /// Write this desired count.
    ScaleTo(u32),
    /// Already at the clamped target.
    NoChange,
    /// A change is warranted but the last write was too recent.
    CoolingDown { proposed: u32, remaining_ms: u64 },
    /// The metric could not be read; keep the current desired count.
    MetricUnavailable(MetricUnavailable),
}

/// Cooldown bookkeeping of one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleState {
    /// Epoch millis of the last successful desired-count write.
    last_write_at: Option<u64>,
    last_direction: Option<ScaleDirection>,
}

impl ScaleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a successful write at `now`.
    pub fn record_write(&mut self, now: u64, direction: ScaleDirection) {
        self.last_write_at = Some(now);
        self.last_direction = Some(direction);
    }

    pub fn last_write_at(&self) -> Option<u64> {
        self.last_write_at
    }

    pub fn last_direction(&self) -> Option<ScaleDirection> {
        self.last_direction
    }
}

/// Unclamped target-tracking desired count.
///
/// A service scaled to zero has no base to multiply; any load brings it
/// back to one task (or the policy minimum).
fn raw_desired(policy: &ScalingPolicy, current: u32, metric: f64) -> u32 {
    if current == 0 {
        return if metric > 0.0 {
            policy.min_capacity.max(1)
        } else {
            policy.min_capacity
        };
    }
    let raw = f64::from(current) * metric / policy.target_value;
    // Absorb a few ulps of float noise so an exact ratio does not round up
    // a whole task; anything beyond that is real load.
    (raw * (1.0 - 4.0 * f64::EPSILON)).ceil().max(0.0) as u32
}

/// Evaluate one autoscaling cycle at `now`.
pub fn evaluate(
    policy: &ScalingPolicy,
    state: &ScaleState,
    current_desired: u32,
    metric: Result<f64, MetricUnavailable>,
    now: u64,
) -> ScaleDecision {
    let metric = match metric {
        Ok(value) if value.is_finite() && value >= 0.0 => value,
        Ok(value) => {
            return ScaleDecision::MetricUnavailable(MetricUnavailable(format!(
                "invalid metric value {value}"
            )));
        }
        Err(e) => return ScaleDecision::MetricUnavailable(e),
    };

    let desired = policy.clamp(raw_desired(policy, current_desired, metric));
    if desired == current_desired {
        return ScaleDecision::NoChange;
    }

    let direction = if desired > current_desired {
        ScaleDirection::Out
    } else {
        ScaleDirection::In
    };
    let cooldown_ms = match direction {
        ScaleDirection::Out => policy.scale_out_cooldown.as_millis() as u64,
        ScaleDirection::In => policy.scale_in_cooldown.as_millis() as u64,
    };

    if let Some(last) = state.last_write_at {
        let elapsed = now.saturating_sub(last);
        if elapsed < cooldown_ms {
            debug!(
                from = current_desired,
                proposed = desired,
                %direction,
                remaining_ms = cooldown_ms - elapsed,
                "scaling suppressed by cooldown"
            );
            return ScaleDecision::CoolingDown {
                proposed: desired,
                remaining_ms: cooldown_ms - elapsed,
            };
        }
    }

    debug!(
        from = current_desired,
        to = desired,
        metric,
        target = policy.target_value,
        %direction,
        "scaling decision"
    );
    ScaleDecision::ScaleTo(desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIN: u64 = 60_000;

    fn policy(min: u32, max: u32) -> ScalingPolicy {
        ScalingPolicy::symmetric(50.0, min, max, Duration::from_secs(300))
    }

    #[test]
    fn scales_out_proportionally() {
        // 4 × 80 / 50 = 6.4 → 7
        let d = evaluate(&policy(1, 10), &ScaleState::new(), 4, Ok(80.0), 0);
        assert_eq!(d, ScaleDecision::ScaleTo(7));
    }

    #[test]
    fn scale_out_is_clamped_to_max() {
        let d = evaluate(&policy(1, 5), &ScaleState::new(), 4, Ok(80.0), 0);
        assert_eq!(d, ScaleDecision::ScaleTo(5));
    }

    #[test]
    fn scale_in_is_clamped_to_min() {
        let d = evaluate(&policy(3, 10), &ScaleState::new(), 8, Ok(5.0), 0);
        assert_eq!(d, ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn exact_ratio_does_not_round_up() {
        // 3 × 70 / 35 is exactly 6 but not exactly representable.
        let p = ScalingPolicy::symmetric(0.35, 1, 10, Duration::ZERO);
        assert_eq!(
            evaluate(&p, &ScaleState::new(), 3, Ok(0.7), 0),
            ScaleDecision::ScaleTo(6)
        );
    }

    #[test]
    fn load_just_over_target_rounds_up() {
        let p = ScalingPolicy::symmetric(50.0, 1, 10, Duration::ZERO);
        assert_eq!(
            evaluate(&p, &ScaleState::new(), 1, Ok(50.000_000_000_1), 0),
            ScaleDecision::ScaleTo(2)
        );
    }

    #[test]
    fn on_target_is_no_change() {
        let d = evaluate(&policy(1, 10), &ScaleState::new(), 4, Ok(50.0), 0);
        assert_eq!(d, ScaleDecision::NoChange);
    }

    #[test]
    fn at_bound_is_no_change() {
        let d = evaluate(&policy(1, 4), &ScaleState::new(), 4, Ok(500.0), 0);
        assert_eq!(d, ScaleDecision::NoChange);
    }

    #[test]
    fn writes_within_cooldown_are_suppressed() {
        let mut state = ScaleState::new();
        state.record_write(0, ScaleDirection::Out);

        let d = evaluate(&policy(1, 10), &state, 4, Ok(80.0), 4 * MIN);
        assert_eq!(
            d,
            ScaleDecision::CoolingDown {
                proposed: 7,
                remaining_ms: MIN
            }
        );
        assert_eq!(
            evaluate(&policy(1, 10), &state, 4, Ok(80.0), 5 * MIN),
            ScaleDecision::ScaleTo(7)
        );
    }

    #[test]
    fn cooldowns_are_per_direction() {
        let p = ScalingPolicy {
            target_value: 50.0,
            min_capacity: 1,
            max_capacity: 10,
            scale_out_cooldown: Duration::from_secs(60),
            scale_in_cooldown: Duration::from_secs(600),
        };
        let mut state = ScaleState::new();
        state.record_write(0, ScaleDirection::Out);

        // Scale-out is allowed again after one minute...
        assert_eq!(evaluate(&p, &state, 4, Ok(80.0), 2 * MIN), ScaleDecision::ScaleTo(7));
        // ...but scale-in still waits out its ten minutes.
        assert!(matches!(
            evaluate(&p, &state, 4, Ok(10.0), 2 * MIN),
            ScaleDecision::CoolingDown { proposed: 1, .. }
        ));
        assert_eq!(state.last_direction(), Some(ScaleDirection::Out));
    }

    #[test]
    fn missing_metric_skips_the_cycle() {
        let d = evaluate(
            &policy(1, 10),
            &ScaleState::new(),
            4,
            Err(MetricUnavailable("collector down".into())),
            0,
        );
        assert!(matches!(d, ScaleDecision::MetricUnavailable(_)));
    }

    #[test]
    fn non_finite_metric_is_unavailable() {
        let d = evaluate(&policy(1, 10), &ScaleState::new(), 4, Ok(f64::NAN), 0);
        assert!(matches!(d, ScaleDecision::MetricUnavailable(_)));
    }

    #[test]
    fn scales_from_zero_on_load() {
        let d = evaluate(&policy(0, 10), &ScaleState::new(), 0, Ok(12.0), 0);
        assert_eq!(d, ScaleDecision::ScaleTo(1));
        let idle = evaluate(&policy(0, 10), &ScaleState::new(), 0, Ok(0.0), 0);
        assert_eq!(idle, ScaleDecision::NoChange);
    }

    #[test]
    fn output_always_within_bounds() {
        let p = policy(2, 6);
        for current in 0..10 {
            for metric in [0.0, 1.0, 25.0, 50.0, 99.0, 400.0] {
                if let ScaleDecision::ScaleTo(n) =
                    evaluate(&p, &ScaleState::new(), current, Ok(metric), 0)
                {
                    assert!((2..=6).contains(&n), "{current} @ {metric} → {n}");
                }
            }
        }
    }
}
