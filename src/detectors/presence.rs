use std::collections::HashSet;

use tracing::debug;

use crate::states::{EntityState, STATE_HOME, StateSource};

/// Added to the proximity threshold once someone is already present.
pub const PROXIMITY_HYSTERESIS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceState {
    /// Nobody is home and guest mode is off.
    #[default]
    Away,
    /// The household is home but nobody is detected in this room.
    Unoccupied,
    Present,
}

impl PresenceState {
    pub fn is_present(self) -> bool {
        self == PresenceState::Present
    }

    /// Pure transition from the household flag and the room detection.
    pub fn next(household: bool, detected: bool) -> Self {
        match (household, detected) {
            (false, _) => PresenceState::Away,
            (true, false) => PresenceState::Unoccupied,
            (true, true) => PresenceState::Present,
        }
    }
}

/// Infers room presence from proximity, binary and device-tracker sensors,
/// gated by the household "home" indicator and guest mode.
#[derive(Debug)]
pub struct PresenceDetector {
    area_name: String,
    slug: String,
    presence_sensors: Vec<String>,
    distance_sensors: Vec<String>,
    threshold: f64,
    guest_entity: String,
    home_entity: String,
    tracked: HashSet<String>,
    state: PresenceState,
}

impl PresenceDetector {
    pub fn new(
        area_name: &str,
        slug: &str,
        presence_sensors: Vec<String>,
        distance_sensors: Vec<String>,
        threshold: f64,
        guest_entity: &str,
        home_entity: &str,
    ) -> Self {
        let tracked = presence_sensors
            .iter()
            .chain(distance_sensors.iter())
            .cloned()
            .chain([guest_entity.to_string(), home_entity.to_string()])
            .collect();
        Self {
            area_name: area_name.to_lowercase(),
            slug: slug.to_lowercase(),
            presence_sensors,
            distance_sensors,
            threshold,
            guest_entity: guest_entity.to_string(),
            home_entity: home_entity.to_string(),
            tracked,
            state: PresenceState::Away,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn handles(&self, entity_id: &str) -> bool {
        self.tracked.contains(entity_id)
    }

    pub fn has_sensors(&self) -> bool {
        !self.presence_sensors.is_empty() || !self.distance_sensors.is_empty()
    }

    pub fn is_present(&self) -> bool {
        self.state.is_present()
    }

    /// The home zone's state is a count of people at home.
    pub fn is_home<S: StateSource + ?Sized>(&self, source: &S) -> bool {
        source
            .state_f64(&self.home_entity)
            .is_some_and(|count| count.trunc() > 0.0)
    }

    pub fn is_guest_mode<S: StateSource + ?Sized>(&self, source: &S) -> bool {
        source.state(&self.guest_entity).is_some_and(|s| s.is_on())
    }

    /// Someone is home, or guests are expected to be.
    pub fn is_occupied<S: StateSource + ?Sized>(&self, source: &S) -> bool {
        self.is_home(source) || self.is_guest_mode(source)
    }

    /// Re-evaluate presence; returns true when it changed.
    pub fn refresh<S: StateSource + ?Sized>(&mut self, source: &S) -> bool {
        let household = self.is_occupied(source);
        let detected = household && self.detect(source);
        let next = PresenceState::next(household, detected);
        if next == self.state {
            return false;
        }
        debug!(area = %self.area_name, from = ?self.state, to = ?next, "presence changed");
        self.state = next;
        true
    }

    fn detect<S: StateSource + ?Sized>(&self, source: &S) -> bool {
        if !self.distance_sensors.is_empty() {
            let limit = if self.state.is_present() {
                self.threshold + PROXIMITY_HYSTERESIS
            } else {
                self.threshold
            };
            return self
                .distance_sensors
                .iter()
                .filter_map(|id| source.state_f64(id))
                .any(|distance| distance.is_finite() && distance < limit);
        }
        self.presence_sensors.iter().any(|id| {
            source
                .state(id)
                .is_some_and(|state| self.sensor_reports_presence(id, &state))
        })
    }

    fn sensor_reports_presence(&self, entity_id: &str, state: &EntityState) -> bool {
        if entity_id.starts_with("binary_sensor.") {
            return state.is_on() || state.state == STATE_HOME;
        }
        if !state.is_available() {
            return false;
        }
        let value = state.state.to_lowercase();
        value == self.area_name || value == self.slug
    }
}
