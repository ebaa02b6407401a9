use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest temperature any zone target or TRV command may take.
pub const MIN_TARGET_C: f64 = 5.0;
/// Highest temperature any zone target or TRV command may take.
pub const MAX_TARGET_C: f64 = 30.0;

pub fn clamp_celsius(value: f64) -> f64 {
    value.clamp(MIN_TARGET_C, MAX_TARGET_C)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Heat,
    Off,
}

impl HvacMode {
    pub fn as_service_str(&self) -> &'static str {
        match self {
            HvacMode::Heat => "heat",
            HvacMode::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
}

/// Boiler supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    AntiCycleCooldown,
    Firing,
    Failsafe,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::AntiCycleCooldown => "anti_cycle_cooldown",
            SupervisorState::Firing => "firing",
            SupervisorState::Failsafe => "failsafe",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Ok,
    PossibleActuatorFailure,
    ValveStuckOpen,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::PossibleActuatorFailure => "POSSIBLE_ACTUATOR_FAILURE",
            HealthStatus::ValveStuckOpen => "VALVE_STUCK_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Heating,
    Cooling,
}

/// Zone-level notifications, carried inside [`Event::Zone`].
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    WindowHoldStarted,
    WindowHoldCleared,
    PreheatStarted { target: f64 },
    Failure { status: HealthStatus },
    HealthChanged { status: HealthStatus },
    BatteryLockChanged { locked: bool },
    /// Output was re-applied; observers should refresh their view of the zone.
    Updated,
}

/// Events published on the plant's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BoilerStateChanged {
        state: SupervisorState,
        previous: SupervisorState,
    },
    LearningUpdated {
        zone_id: String,
        kind: CycleKind,
        observed_rate: f64,
        samples: usize,
    },
    Zone {
        zone_id: String,
        event: ZoneEvent,
    },
}
