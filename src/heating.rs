use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{MAX_TARGET_C, MIN_TARGET_C};

/// Proportional over-drive applied on top of the room error. TRVs regulate
/// against their own (radiator-side) sensor, so they need a higher setpoint to
/// actually bring the room up.
pub const DEFAULT_COMPENSATION_GAIN: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensation {
    pub error: f64,
    pub compensated: f64,
    pub clamped: f64,
}

pub fn calculate_compensation(target: f64, current: f64) -> Compensation {
    calculate_compensation_with(target, current, DEFAULT_COMPENSATION_GAIN, MIN_TARGET_C, MAX_TARGET_C)
}

pub fn calculate_compensation_with(
    target: f64,
    current: f64,
    gain: f64,
    min: f64,
    max: f64,
) -> Compensation {
    let error = target - current;
    let compensated = target + error * gain;
    Compensation {
        error,
        compensated,
        clamped: compensated.clamp(min, max),
    }
}

/// When to start heating so that `target` is reached by `effective_at` at
/// `rate` °C/h. `None` when preheat is not allowed or not needed.
pub fn compute_preheat_start(
    current: Option<f64>,
    target: f64,
    effective_at: DateTime<Utc>,
    rate: f64,
    allow_preheat: bool,
) -> Option<DateTime<Utc>> {
    if !allow_preheat {
        return None;
    }
    let current = current?;
    if target <= current || rate <= 0.0 {
        return None;
    }
    let seconds = (target - current) / rate * 3600.0;
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some(effective_at - TimeDelta::milliseconds((seconds * 1000.0).round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compensation_overdrives_towards_target() {
        let c = calculate_compensation(20.0, 18.0);
        assert_eq!(c.error, 2.0);
        assert_eq!(c.compensated, 24.0);
        assert_eq!(c.clamped, 24.0);
    }

    #[test]
    fn compensation_clamps_to_floor_and_ceiling() {
        let c = calculate_compensation(5.0, 30.0);
        assert_eq!(c.clamped, 5.0);
        let c = calculate_compensation(28.0, 20.0);
        assert_eq!(c.compensated, 44.0);
        assert_eq!(c.clamped, 30.0);
    }

    #[test]
    fn preheat_starts_two_hours_early() {
        let t = Utc.with_ymd_and_hms(2026, 1, 5, 7, 0, 0).unwrap();
        let start = compute_preheat_start(Some(18.0), 21.0, t, 1.5, true);
        assert_eq!(start, Some(t - TimeDelta::hours(2)));
    }

    #[test]
    fn preheat_skipped_when_not_allowed_or_not_needed() {
        let t = Utc.with_ymd_and_hms(2026, 1, 5, 7, 0, 0).unwrap();
        assert_eq!(compute_preheat_start(Some(18.0), 21.0, t, 1.5, false), None);
        assert_eq!(compute_preheat_start(Some(21.0), 21.0, t, 1.5, true), None);
        assert_eq!(compute_preheat_start(Some(18.0), 21.0, t, 0.0, true), None);
        assert_eq!(compute_preheat_start(None, 21.0, t, 1.5, true), None);
    }
}
