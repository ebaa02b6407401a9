#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use heatplant::{EntityState, Error, MemoryStore, Plant, PlantConfig, Result, ServiceBus, ServiceCall, StateSnapshot, StateSource};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Monday 2026-01-05 08:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
}

pub fn secs(n: i64) -> TimeDelta {
    TimeDelta::seconds(n)
}

pub fn mins(n: i64) -> TimeDelta {
    TimeDelta::minutes(n)
}

/// In-process host: a state table plus a recording service bus that applies
/// the obvious effect of each call back onto the states.
#[derive(Default)]
pub struct FakeHost {
    states: StateSnapshot,
    calls: Mutex<Vec<ServiceCall>>,
    failures: Mutex<HashMap<String, usize>>,
    missing: Mutex<HashSet<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, entity_id: &str, state: &str) {
        self.states.set(entity_id, EntityState::new(state));
    }

    pub fn set_entity(&self, entity_id: &str, state: EntityState) {
        self.states.set(entity_id, state);
    }

    pub fn remove(&self, entity_id: &str) {
        self.states.remove(entity_id);
    }

    /// Make the next `times` calls to `domain.service` fail.
    pub fn fail(&self, service: &str, times: usize) {
        self.failures.lock().insert(service.to_string(), times);
    }

    pub fn heal(&self) {
        self.failures.lock().clear();
    }

    pub fn unregister(&self, service: &str) {
        self.missing.lock().insert(service.to_string());
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, service: &str) -> Vec<ServiceCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.to_string() == service)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Last temperature sent to any of the given TRVs.
    pub fn last_trv_temperature(&self, entity_id: &str) -> Option<f64> {
        self.calls
            .lock()
            .iter()
            .rev()
            .filter(|c| c.to_string() == "climate.set_temperature")
            .find(|c| c.entity_ids().iter().any(|e| e == entity_id))
            .and_then(|c| c.data["temperature"].as_f64())
    }

    pub fn entity(&self, entity_id: &str) -> Option<EntityState> {
        self.states.state(entity_id)
    }

    fn apply(&self, call: &ServiceCall) {
        let entities = call.entity_ids();
        match (call.domain.as_str(), call.service.as_str()) {
            (_, "turn_on") => entities.iter().for_each(|e| self.set(e, "on")),
            (_, "turn_off") => entities.iter().for_each(|e| self.set(e, "off")),
            ("climate", "set_hvac_mode") => {
                let mode = call.data["hvac_mode"].as_str().unwrap_or("off").to_string();
                for e in &entities {
                    self.states.update(e, |s| s.state = mode.clone());
                }
            }
            ("climate", "set_temperature") => {
                let temp = call.data["temperature"].clone();
                for e in &entities {
                    self.states.update(e, |s| {
                        s.attributes.insert("temperature".into(), temp.clone());
                    });
                }
            }
            ("number", "set_value") => {
                if let Some(value) = call.data["value"].as_f64() {
                    entities.iter().for_each(|e| self.set(e, &value.to_string()));
                }
            }
            _ => {}
        }
    }
}

impl StateSource for FakeHost {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.state(entity_id)
    }
}

impl ServiceBus for FakeHost {
    fn has_service(&self, domain: &str, service: &str) -> bool {
        !self.missing.lock().contains(&format!("{domain}.{service}"))
    }

    async fn call(&self, call: ServiceCall) -> Result<()> {
        self.calls.lock().push(call.clone());
        let name = call.to_string();
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(Error::ServiceUnavailable(name));
            }
        }
        self.apply(&call);
        Ok(())
    }
}

pub fn trv(hvac: &str, current: f64) -> EntityState {
    EntityState::new(hvac).with_attribute("current_temperature", current)
}

/// One switch boiler and a single living-room zone driven by one TRV and one
/// room sensor. Someone is home and the master switch is on.
pub fn living_room_config(host: &Arc<FakeHost>) -> PlantConfig {
    host.set("switch.boiler", "off");
    host.set("switch.heatplant_master_heating", "on");
    host.set("zone.home", "1");
    host.set_entity("climate.trv_living", trv("heat", 18.0));
    host.set("sensor.living_temp", "18.0");
    host.set("number.living_room_schedule_target", "20.0");

    let mut zone = heatplant::ZoneConfig::new("living", "Living Room");
    zone.trvs = vec!["climate.trv_living".into()];
    zone.temp_sensors = vec!["sensor.living_temp".into()];
    zone.window_sensors = vec!["binary_sensor.living_window".into()];
    zone.battery_sensors = vec!["sensor.trv_living_battery".into()];

    let mut config = PlantConfig::new("switch.boiler").with_zone(zone);
    config.valve_maintenance = false;
    config
}

pub fn living_room_plant(host: &Arc<FakeHost>) -> Plant<FakeHost, MemoryStore> {
    let config = living_room_config(host);
    Plant::new(config, host.clone(), MemoryStore::new()).unwrap()
}

/// Everything published since the last drain.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
