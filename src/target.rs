use crate::types::clamp_celsius;

/// Inputs shared by every target strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetContext {
    pub schedule_target: Option<f64>,
    pub off_temp: f64,
    pub comfort_temp: f64,
    pub eco_temp: f64,
    pub has_presence_sensors: bool,
    pub presence_on: bool,
}

/// Target-selection strategies, in no particular order; see [`select_mode`]
/// for priority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetMode {
    Scheduled,
    Eco,
    Boost(f64),
    Save(f64),
    Preheat(f64),
    Failsafe(f64),
}

impl TargetMode {
    pub fn name(&self) -> &'static str {
        match self {
            TargetMode::Scheduled => "scheduled",
            TargetMode::Eco => "eco",
            TargetMode::Boost(_) => "boost",
            TargetMode::Save(_) => "save",
            TargetMode::Preheat(_) => "preheat",
            TargetMode::Failsafe(_) => "failsafe",
        }
    }

    /// Boost and Save are user overrides of the schedule.
    pub fn is_override(&self) -> bool {
        matches!(self, TargetMode::Boost(_) | TargetMode::Save(_))
    }

    /// Fixed-value modes opt out of presence post-processing.
    pub fn uses_post_processing(&self) -> bool {
        matches!(self, TargetMode::Scheduled | TargetMode::Eco)
    }

    pub fn raw_target(&self, ctx: &TargetContext) -> f64 {
        match *self {
            TargetMode::Scheduled => ctx.schedule_target.unwrap_or(ctx.off_temp),
            TargetMode::Eco => ctx.eco_temp,
            TargetMode::Boost(t)
            | TargetMode::Save(t)
            | TargetMode::Preheat(t)
            | TargetMode::Failsafe(t) => t,
        }
    }

    pub fn final_target(&self, ctx: &TargetContext) -> f64 {
        let raw = self.raw_target(ctx);
        let processed = if self.uses_post_processing() {
            apply_presence_boost(raw, ctx)
        } else {
            raw
        };
        clamp_celsius(processed)
    }
}

/// An occupied room left at "off" is raised to at least comfort.
pub fn apply_presence_boost(target: f64, ctx: &TargetContext) -> f64 {
    if ctx.has_presence_sensors && ctx.presence_on && target <= ctx.off_temp {
        return target.max(ctx.comfort_temp);
    }
    target
}

/// What the zone knows when choosing a mode.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModeInputs {
    pub battery_lock: Option<f64>,
    pub manual_override: Option<TargetMode>,
    pub preheat_target: Option<f64>,
    pub occupied: bool,
}

/// First match wins: failsafe, manual override, preheat, eco, schedule.
pub fn select_mode(inputs: &ModeInputs) -> TargetMode {
    if let Some(safety) = inputs.battery_lock {
        return TargetMode::Failsafe(safety);
    }
    if let Some(mode) = inputs.manual_override.filter(TargetMode::is_override) {
        return mode;
    }
    if let Some(target) = inputs.preheat_target {
        return TargetMode::Preheat(target);
    }
    if !inputs.occupied {
        return TargetMode::Eco;
    }
    TargetMode::Scheduled
}

/// Outcome of a direct temperature request against the current schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualRequest {
    Boost(f64),
    Save(f64),
    Clear,
}

pub fn classify_manual_request(requested: f64, schedule_target: f64) -> ManualRequest {
    if requested > schedule_target {
        ManualRequest::Boost(requested)
    } else if requested < schedule_target {
        ManualRequest::Save(requested)
    } else {
        ManualRequest::Clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TargetContext {
        TargetContext {
            schedule_target: None,
            off_temp: 12.0,
            comfort_temp: 20.0,
            eco_temp: 16.0,
            has_presence_sensors: true,
            presence_on: true,
        }
    }

    #[test]
    fn unset_schedule_with_presence_goes_to_comfort() {
        assert_eq!(TargetMode::Scheduled.final_target(&ctx()), 20.0);
    }

    #[test]
    fn unset_schedule_without_presence_stays_off() {
        let mut c = ctx();
        c.presence_on = false;
        assert_eq!(TargetMode::Scheduled.final_target(&c), 12.0);
        c.presence_on = true;
        c.has_presence_sensors = false;
        assert_eq!(TargetMode::Scheduled.final_target(&c), 12.0);
    }

    #[test]
    fn eco_boost_only_when_eco_at_or_below_off() {
        assert_eq!(TargetMode::Eco.final_target(&ctx()), 16.0);

        let mut c = ctx();
        c.eco_temp = 10.0;
        assert_eq!(TargetMode::Eco.final_target(&c), 20.0);
    }

    #[test]
    fn fixed_modes_skip_presence_boost() {
        let c = ctx();
        assert_eq!(TargetMode::Save(8.0).final_target(&c), 8.0);
        assert_eq!(TargetMode::Preheat(11.0).final_target(&c), 11.0);
        assert_eq!(TargetMode::Failsafe(15.0).final_target(&c), 15.0);
    }

    #[test]
    fn final_target_is_clamped() {
        let c = ctx();
        assert_eq!(TargetMode::Boost(35.0).final_target(&c), 30.0);
        assert_eq!(TargetMode::Save(2.0).final_target(&c), 5.0);
    }

    #[test]
    fn selection_priority() {
        let mut inputs = ModeInputs {
            battery_lock: Some(15.0),
            manual_override: Some(TargetMode::Boost(23.0)),
            preheat_target: Some(21.0),
            occupied: false,
        };
        assert_eq!(select_mode(&inputs), TargetMode::Failsafe(15.0));
        inputs.battery_lock = None;
        assert_eq!(select_mode(&inputs), TargetMode::Boost(23.0));
        inputs.manual_override = None;
        assert_eq!(select_mode(&inputs), TargetMode::Preheat(21.0));
        inputs.preheat_target = None;
        assert_eq!(select_mode(&inputs), TargetMode::Eco);
        inputs.occupied = true;
        assert_eq!(select_mode(&inputs), TargetMode::Scheduled);
    }

    #[test]
    fn manual_requests_against_schedule() {
        assert_eq!(classify_manual_request(23.0, 20.0), ManualRequest::Boost(23.0));
        assert_eq!(classify_manual_request(17.0, 20.0), ManualRequest::Save(17.0));
        assert_eq!(classify_manual_request(20.0, 20.0), ManualRequest::Clear);
    }
}
