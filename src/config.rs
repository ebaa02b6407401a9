//! Plant configuration.
//! Defaults mirror the values the heating integration ships with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Deserializer};

use crate::{Error, Result};

pub const DEFAULT_BOOST_TEMP: f64 = 25.0;
pub const DEFAULT_OFF_TEMP: f64 = 5.0;
pub const DEFAULT_COMFORT_TEMP: f64 = 21.0;
pub const DEFAULT_ECO_TEMP: f64 = 16.0;
pub const DEFAULT_MIN_CYCLE_MINUTES: i64 = 5;
pub const DEFAULT_WINDOW_THRESHOLD: f64 = 0.1;
pub const DEFAULT_PROXIMITY_THRESHOLD: f64 = 2.5;
pub const DEFAULT_MAINTENANCE_DAY: Weekday = Weekday::Thu;

pub const DEFAULT_MASTER_SWITCH: &str = "switch.heatplant_master_heating";
pub const DEFAULT_GUEST_SWITCH: &str = "switch.heatplant_guest_mode";
pub const DEFAULT_ECO_NUMBER: &str = "number.heatplant_eco_temp";
pub const DEFAULT_HOME_ZONE: &str = "zone.home";

pub const DEFAULT_CONFIG_PATH: &str = "heatplant.json";
pub const DEFAULT_STORAGE_PATH: &str = "heatplant_learning.json";
pub const DEFAULT_POLL_SECS: u64 = 10;

fn default_maintenance_time() -> NaiveTime {
    NaiveTime::from_hms_opt(11, 0, 0).unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantConfig {
    pub boiler_entity: String,
    #[serde(default = "defaults::boost_temp")]
    pub boost_temp: f64,
    #[serde(default = "defaults::off_temp")]
    pub off_temp: f64,
    #[serde(default = "defaults::comfort_temp")]
    pub comfort_temp: f64,
    #[serde(default = "defaults::eco_temp")]
    pub eco_temp: f64,
    /// Minimum boiler off-time after firing, in minutes.
    #[serde(default = "defaults::min_cycle")]
    pub min_cycle: i64,
    /// Inferred-window drop rate in °C per minute.
    #[serde(default = "defaults::window_threshold")]
    pub window_threshold: f64,
    #[serde(default = "defaults::proximity_threshold")]
    pub proximity_threshold: f64,
    #[serde(default = "defaults::enabled")]
    pub valve_maintenance: bool,
    #[serde(default = "defaults::maintenance_day", deserialize_with = "de_weekday")]
    pub maintenance_day: Weekday,
    /// Time of day (UTC) for the weekly valve exercise.
    #[serde(default = "default_maintenance_time", deserialize_with = "de_time")]
    pub maintenance_time: NaiveTime,
    #[serde(default)]
    pub weather_entity: Option<String>,
    #[serde(default = "defaults::master_switch")]
    pub master_switch: String,
    #[serde(default = "defaults::guest_switch")]
    pub guest_switch: String,
    #[serde(default = "defaults::eco_number")]
    pub eco_number: String,
    #[serde(default = "defaults::home_zone")]
    pub home_zone: String,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

impl PlantConfig {
    pub fn new(boiler_entity: impl Into<String>) -> Self {
        Self {
            boiler_entity: boiler_entity.into(),
            boost_temp: DEFAULT_BOOST_TEMP,
            off_temp: DEFAULT_OFF_TEMP,
            comfort_temp: DEFAULT_COMFORT_TEMP,
            eco_temp: DEFAULT_ECO_TEMP,
            min_cycle: DEFAULT_MIN_CYCLE_MINUTES,
            window_threshold: DEFAULT_WINDOW_THRESHOLD,
            proximity_threshold: DEFAULT_PROXIMITY_THRESHOLD,
            valve_maintenance: true,
            maintenance_day: DEFAULT_MAINTENANCE_DAY,
            maintenance_time: default_maintenance_time(),
            weather_entity: None,
            master_switch: DEFAULT_MASTER_SWITCH.to_string(),
            guest_switch: DEFAULT_GUEST_SWITCH.to_string(),
            eco_number: DEFAULT_ECO_NUMBER.to_string(),
            home_zone: DEFAULT_HOME_ZONE.to_string(),
            zones: Vec::new(),
        }
    }

    pub fn with_zone(mut self, zone: ZoneConfig) -> Self {
        self.zones.push(zone);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: PlantConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.boiler_entity.trim().is_empty() {
            return Err(Error::Config("boiler_entity must not be empty".into()));
        }
        if !self.boiler_entity.contains('.') {
            return Err(Error::Config(format!(
                "boiler_entity {} is not an entity id",
                self.boiler_entity
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for zone in &self.zones {
            if !seen.insert(zone.id.as_str()) {
                return Err(Error::Config(format!("duplicate zone id {}", zone.id)));
            }
        }
        Ok(())
    }
}

/// One independently controlled area.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub trvs: Vec<String>,
    #[serde(default)]
    pub temp_sensors: Vec<String>,
    #[serde(default)]
    pub humidity_sensors: Vec<String>,
    #[serde(default)]
    pub window_sensors: Vec<String>,
    #[serde(default)]
    pub presence_sensors: Vec<String>,
    #[serde(default)]
    pub distance_sensors: Vec<String>,
    #[serde(default)]
    pub battery_sensors: Vec<String>,
}

impl ZoneConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn slug(&self) -> String {
        self.slug.clone().unwrap_or_else(|| slugify(&self.name))
    }

    pub fn schedule_entity(&self) -> String {
        format!("number.{}_schedule_target", self.slug())
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            slug.push(c.to_ascii_lowercase());
            pending_sep = false;
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Daemon settings, read from the environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub base_url: String,
    pub token: Option<String>,
    pub storage_path: PathBuf,
    pub poll_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("HEATPLANT_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let base_url = match std::env::var("HEATPLANT_URL") {
            Ok(v) if !v.trim().is_empty() => v.trim().trim_end_matches('/').to_string(),
            _ => return Err(Error::Config("HEATPLANT_URL must be set".into())),
        };
        let token = std::env::var("HEATPLANT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        let storage_path = std::env::var("HEATPLANT_STORAGE")
            .unwrap_or_else(|_| DEFAULT_STORAGE_PATH.to_string());
        let poll_secs = std::env::var("HEATPLANT_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_POLL_SECS);

        Ok(Self {
            config_path: PathBuf::from(config_path),
            base_url,
            token,
            storage_path: PathBuf::from(storage_path),
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

mod defaults {
    use super::*;

    pub fn boost_temp() -> f64 {
        DEFAULT_BOOST_TEMP
    }
    pub fn off_temp() -> f64 {
        DEFAULT_OFF_TEMP
    }
    pub fn comfort_temp() -> f64 {
        DEFAULT_COMFORT_TEMP
    }
    pub fn eco_temp() -> f64 {
        DEFAULT_ECO_TEMP
    }
    pub fn min_cycle() -> i64 {
        DEFAULT_MIN_CYCLE_MINUTES
    }
    pub fn window_threshold() -> f64 {
        DEFAULT_WINDOW_THRESHOLD
    }
    pub fn proximity_threshold() -> f64 {
        DEFAULT_PROXIMITY_THRESHOLD
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn maintenance_day() -> Weekday {
        DEFAULT_MAINTENANCE_DAY
    }
    pub fn master_switch() -> String {
        DEFAULT_MASTER_SWITCH.to_string()
    }
    pub fn guest_switch() -> String {
        DEFAULT_GUEST_SWITCH.to_string()
    }
    pub fn eco_number() -> String {
        DEFAULT_ECO_NUMBER.to_string()
    }
    pub fn home_zone() -> String {
        DEFAULT_HOME_ZONE.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WeekdayRepr {
    Index(u8),
    Name(String),
}

/// Accepts 0 = Monday .. 6 = Sunday, or an English weekday name. Anything
/// else falls back to the default day.
fn de_weekday<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Weekday, D::Error> {
    let day = match WeekdayRepr::deserialize(deserializer)? {
        WeekdayRepr::Index(i) if i < 7 => Weekday::try_from(i).ok(),
        WeekdayRepr::Index(_) => None,
        WeekdayRepr::Name(name) => name.trim().parse::<Weekday>().ok(),
    };
    Ok(day.unwrap_or(DEFAULT_MAINTENANCE_DAY))
}

fn de_time<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<NaiveTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let raw = raw.trim();
    Ok(NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .unwrap_or_else(|_| default_maintenance_time()))
}
