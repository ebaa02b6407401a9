use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use crate::states::StateSource;
use crate::timer::Timer;

pub const HOLD_MINUTES: i64 = 15;
pub const SAMPLE_WINDOW_MINUTES: i64 = 3;
/// Absolute drop that triggers a hold regardless of rate.
pub const DROP_TRIGGER_C: f64 = 0.5;

/// Window state: physical sensor axis times inferred-hold axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowState {
    #[default]
    Monitoring,
    SensorOpen,
    Hold,
    SensorOpenHold,
}

impl WindowState {
    pub fn window_open(self) -> bool {
        matches!(self, WindowState::SensorOpen | WindowState::SensorOpenHold)
    }

    pub fn hold_active(self) -> bool {
        matches!(self, WindowState::Hold | WindowState::SensorOpenHold)
    }

    pub fn on_sensor_change(self, open: bool) -> Self {
        match (self.hold_active(), open) {
            (false, false) => WindowState::Monitoring,
            (false, true) => WindowState::SensorOpen,
            (true, false) => WindowState::Hold,
            (true, true) => WindowState::SensorOpenHold,
        }
    }

    pub fn on_hold_started(self) -> Self {
        if self.window_open() {
            WindowState::SensorOpenHold
        } else {
            WindowState::Hold
        }
    }

    pub fn on_hold_cleared(self) -> Self {
        if self.window_open() {
            WindowState::SensorOpen
        } else {
            WindowState::Monitoring
        }
    }
}

/// What a call into the detector changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    None,
    SensorChanged,
    HoldStarted,
    HoldCleared,
}

/// Tracks physical window sensors and infers open windows from rapid
/// temperature drops when the zone has no sensors.
#[derive(Debug)]
pub struct WindowDetector {
    sensors: Vec<String>,
    sensor_set: HashSet<String>,
    threshold: f64,
    hold_duration: TimeDelta,
    state: WindowState,
    hold: Timer,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl WindowDetector {
    /// `threshold` is the inferred-open drop rate in °C per minute.
    pub fn new(sensors: Vec<String>, threshold: f64) -> Self {
        let sensor_set = sensors.iter().cloned().collect();
        Self {
            sensors,
            sensor_set,
            threshold,
            hold_duration: TimeDelta::minutes(HOLD_MINUTES),
            state: WindowState::Monitoring,
            hold: Timer::new(),
            samples: VecDeque::new(),
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn handles(&self, entity_id: &str) -> bool {
        self.sensor_set.contains(entity_id)
    }

    pub fn has_sensors(&self) -> bool {
        !self.sensors.is_empty()
    }

    pub fn window_open(&self) -> bool {
        self.state.window_open()
    }

    pub fn hold_until(&self) -> Option<DateTime<Utc>> {
        self.hold.deadline()
    }

    pub fn is_hold_active(&self, now: DateTime<Utc>) -> bool {
        self.state.hold_active() && self.hold.deadline().is_some_and(|until| now < until)
    }

    pub fn is_forced_off(&self, now: DateTime<Utc>) -> bool {
        self.state.window_open() || self.is_hold_active(now)
    }

    /// Re-read the physical sensors; any sensor `on` means open.
    pub fn refresh<S: StateSource + ?Sized>(&mut self, source: &S) -> WindowChange {
        let open = self
            .sensors
            .iter()
            .filter_map(|id| source.state(id))
            .any(|s| s.is_on());
        let next = self.state.on_sensor_change(open);
        if next == self.state {
            return WindowChange::None;
        }
        debug!(from = ?self.state, to = ?next, "window sensor state changed");
        self.state = next;
        WindowChange::SensorChanged
    }

    /// Feed a room temperature reading. Only zones without physical window
    /// sensors infer openings.
    pub fn record_temperature(&mut self, temperature: f64, now: DateTime<Utc>) -> WindowChange {
        if self.has_sensors() || !temperature.is_finite() {
            return WindowChange::None;
        }
        self.samples.push_back((now, temperature));
        let cutoff = now - TimeDelta::minutes(SAMPLE_WINDOW_MINUTES);
        while self.samples.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.samples.pop_front();
        }
        if self.samples.len() < 2 {
            return WindowChange::None;
        }
        let Some(&(oldest_ts, oldest_temp)) = self.samples.front() else {
            return WindowChange::None;
        };
        let minutes = (now - oldest_ts).num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return WindowChange::None;
        }
        let drop = oldest_temp - temperature;
        let rate = drop / minutes;
        if drop < DROP_TRIGGER_C && rate < self.threshold {
            return WindowChange::None;
        }
        info!(drop, rate, "open window inferred from temperature drop");
        self.samples.clear();
        self.start_hold(now);
        WindowChange::HoldStarted
    }

    /// Start (or restart) the inferred-open hold.
    pub fn start_hold(&mut self, now: DateTime<Utc>) {
        self.hold.arm(now + self.hold_duration);
        self.state = self.state.on_hold_started();
    }

    /// Clear the hold once its timer is due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> WindowChange {
        if !self.hold.fire(now) {
            return WindowChange::None;
        }
        self.state = self.state.on_hold_cleared();
        info!("window hold cleared");
        WindowChange::HoldCleared
    }

    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.hold.deadline()
    }

    pub fn teardown(&mut self) {
        self.hold.cancel();
        self.samples.clear();
        self.state = self.state.on_hold_cleared();
    }
}
