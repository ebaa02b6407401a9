use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::storage::Storage;
use crate::types::{CycleKind, Event};

pub const DEFAULT_HEATING_RATE: f64 = 1.5;
pub const DEFAULT_COOLING_RATE: f64 = 0.5;
pub const HISTORY_CAP: usize = 50;
pub const MIN_SAMPLES: usize = 5;
pub const MIN_CYCLE_MINUTES: i64 = 15;
pub const MIN_RATE: f64 = 0.1;
pub const MAX_RATE: f64 = 5.0;

/// One completed cycle: outdoor temperature at the start and the observed
/// rate in °C/h.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub outdoor: f64,
    pub rate: f64,
}

/// Persisted learning state. Field names are the storage schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningHistory {
    #[serde(default)]
    pub zone_heating_history: HashMap<String, VecDeque<RateSample>>,
    #[serde(default)]
    pub zone_cooling_history: HashMap<String, VecDeque<RateSample>>,
}

impl LearningHistory {
    /// Decode a stored blob. Anything that does not match the current schema
    /// yields an empty history.
    pub fn from_blob(blob: Value) -> Self {
        match serde_json::from_value::<Self>(blob) {
            Ok(mut history) => {
                for samples in history
                    .zone_heating_history
                    .values_mut()
                    .chain(history.zone_cooling_history.values_mut())
                {
                    samples.retain(|s| s.outdoor.is_finite() && s.rate.is_finite());
                    while samples.len() > HISTORY_CAP {
                        samples.pop_front();
                    }
                }
                history
            }
            Err(e) => {
                debug!(error = %e, "learning blob does not match schema; starting empty");
                Self::default()
            }
        }
    }

    pub fn to_blob(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn samples(&self, zone_id: &str, kind: CycleKind) -> Option<&VecDeque<RateSample>> {
        self.map(kind).get(zone_id)
    }

    fn map(&self, kind: CycleKind) -> &HashMap<String, VecDeque<RateSample>> {
        match kind {
            CycleKind::Heating => &self.zone_heating_history,
            CycleKind::Cooling => &self.zone_cooling_history,
        }
    }

    fn map_mut(&mut self, kind: CycleKind) -> &mut HashMap<String, VecDeque<RateSample>> {
        match kind {
            CycleKind::Heating => &mut self.zone_heating_history,
            CycleKind::Cooling => &mut self.zone_cooling_history,
        }
    }

    /// Append with FIFO eviction; returns the new length.
    fn push(&mut self, zone_id: &str, kind: CycleKind, sample: RateSample) -> usize {
        let samples = self.map_mut(kind).entry(zone_id.to_string()).or_default();
        samples.push_back(sample);
        while samples.len() > HISTORY_CAP {
            samples.pop_front();
        }
        samples.len()
    }
}

/// Ordinary least squares fit of `rate = slope * outdoor + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub samples: usize,
}

impl Regression {
    /// `None` below the sample minimum or when outdoor readings have no
    /// variance.
    pub fn fit<'a>(samples: impl IntoIterator<Item = &'a RateSample>) -> Option<Self> {
        let points: Vec<&RateSample> = samples.into_iter().collect();
        let n = points.len();
        if n < MIN_SAMPLES {
            return None;
        }
        let nf = n as f64;
        let mean_x = points.iter().map(|p| p.outdoor).sum::<f64>() / nf;
        let mean_y = points.iter().map(|p| p.rate).sum::<f64>() / nf;
        let (mut sxx, mut sxy) = (0.0, 0.0);
        for p in &points {
            let dx = p.outdoor - mean_x;
            sxx += dx * dx;
            sxy += dx * (p.rate - mean_y);
        }
        if sxx.abs() < f64::EPSILON {
            return None;
        }
        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: mean_y - slope * mean_x,
            samples: n,
        })
    }

    pub fn predict(&self, outdoor: f64) -> f64 {
        self.slope * outdoor + self.intercept
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveCycle {
    started: DateTime<Utc>,
    start_temp: f64,
    outdoor: Option<f64>,
    sunny: bool,
}

#[derive(Debug, Default)]
struct Inner {
    history: LearningHistory,
    heating: HashMap<String, ActiveCycle>,
    cooling: HashMap<String, ActiveCycle>,
}

impl Inner {
    fn active(&mut self, kind: CycleKind) -> &mut HashMap<String, ActiveCycle> {
        match kind {
            CycleKind::Heating => &mut self.heating,
            CycleKind::Cooling => &mut self.cooling,
        }
    }
}

fn default_rate(kind: CycleKind) -> f64 {
    match kind {
        CycleKind::Heating => DEFAULT_HEATING_RATE,
        CycleKind::Cooling => DEFAULT_COOLING_RATE,
    }
}

/// Learns per-zone heating and cooling rates as a function of outdoor
/// temperature.
///
/// Shared by every zone. Each completed cycle that passes the quality checks
/// is appended to the zone's history, persisted through `S` and announced as
/// [`Event::LearningUpdated`]. Persistence failures are logged and otherwise
/// ignored: learning is advisory and must never stall a zone.
pub struct ThermalLearningEngine<S> {
    storage: S,
    inner: Mutex<Inner>,
    events: broadcast::Sender<Event>,
}

impl<S: Storage> ThermalLearningEngine<S> {
    pub fn new(storage: S, events: broadcast::Sender<Event>) -> Self {
        Self {
            storage,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Replace in-memory history with whatever storage holds. A failed load
    /// leaves the engine empty.
    pub async fn load(&self) {
        let history = match self.storage.load().await {
            Ok(Some(blob)) => LearningHistory::from_blob(blob),
            Ok(None) => LearningHistory::default(),
            Err(e) => {
                warn!(error = %e, "failed to load learning history; starting empty");
                LearningHistory::default()
            }
        };
        let zones = history.zone_heating_history.len() + history.zone_cooling_history.len();
        info!(zones, "learning history loaded");
        self.inner.lock().history = history;
    }

    pub fn start_cycle(&self, zone_id: &str, start_temp: f64, outdoor: Option<f64>, sunny: bool, now: DateTime<Utc>) {
        self.begin(CycleKind::Heating, zone_id, start_temp, outdoor, sunny, now);
    }

    pub fn start_cooling_cycle(
        &self,
        zone_id: &str,
        start_temp: f64,
        outdoor: Option<f64>,
        sunny: bool,
        now: DateTime<Utc>,
    ) {
        self.begin(CycleKind::Cooling, zone_id, start_temp, outdoor, sunny, now);
    }

    /// Close the zone's heating cycle. Returns the recorded rate when a
    /// sample was accepted.
    pub async fn end_cycle(&self, zone_id: &str, end_temp: f64, now: DateTime<Utc>) -> Option<f64> {
        self.finish(CycleKind::Heating, zone_id, end_temp, now).await
    }

    pub async fn end_cooling_cycle(&self, zone_id: &str, end_temp: f64, now: DateTime<Utc>) -> Option<f64> {
        self.finish(CycleKind::Cooling, zone_id, end_temp, now).await
    }

    /// Predicted heating rate (°C/h) at `outdoor`.
    pub fn rate(&self, zone_id: &str, outdoor: Option<f64>) -> f64 {
        self.predict(CycleKind::Heating, zone_id, outdoor)
    }

    /// Predicted cooling rate (°C/h) at `outdoor`.
    pub fn cooling_rate(&self, zone_id: &str, outdoor: Option<f64>) -> f64 {
        self.predict(CycleKind::Cooling, zone_id, outdoor)
    }

    pub fn heating_regression(&self, zone_id: &str) -> Option<Regression> {
        self.regression(CycleKind::Heating, zone_id)
    }

    pub fn cooling_regression(&self, zone_id: &str) -> Option<Regression> {
        self.regression(CycleKind::Cooling, zone_id)
    }

    pub fn history_len(&self, zone_id: &str, kind: CycleKind) -> usize {
        self.inner
            .lock()
            .history
            .samples(zone_id, kind)
            .map_or(0, VecDeque::len)
    }

    pub fn history(&self) -> LearningHistory {
        self.inner.lock().history.clone()
    }

    pub fn has_active_cycle(&self, zone_id: &str, kind: CycleKind) -> bool {
        self.inner.lock().active(kind).contains_key(zone_id)
    }

    /// Drop any open cycles for a zone, e.g. when it is torn down.
    pub fn abandon_cycles(&self, zone_id: &str) {
        let mut inner = self.inner.lock();
        inner.heating.remove(zone_id);
        inner.cooling.remove(zone_id);
    }

    fn begin(
        &self,
        kind: CycleKind,
        zone_id: &str,
        start_temp: f64,
        outdoor: Option<f64>,
        sunny: bool,
        now: DateTime<Utc>,
    ) {
        debug!(zone = zone_id, ?kind, start_temp, ?outdoor, sunny, "learning cycle started");
        self.inner.lock().active(kind).insert(
            zone_id.to_string(),
            ActiveCycle {
                started: now,
                start_temp,
                outdoor,
                sunny,
            },
        );
    }

    async fn finish(&self, kind: CycleKind, zone_id: &str, end_temp: f64, now: DateTime<Utc>) -> Option<f64> {
        let (rate, samples, blob) = {
            let mut inner = self.inner.lock();
            let cycle = inner.active(kind).remove(zone_id)?;

            let elapsed = now - cycle.started;
            if elapsed <= TimeDelta::minutes(MIN_CYCLE_MINUTES) {
                debug!(zone = zone_id, ?kind, secs = elapsed.num_seconds(), "cycle too short; discarded");
                return None;
            }
            let delta = match kind {
                CycleKind::Heating => end_temp - cycle.start_temp,
                CycleKind::Cooling => cycle.start_temp - end_temp,
            };
            if delta.is_nan() || delta <= 0.0 {
                debug!(zone = zone_id, ?kind, delta, "cycle moved the wrong way; discarded");
                return None;
            }
            let Some(outdoor) = cycle.outdoor.filter(|t| t.is_finite()) else {
                debug!(zone = zone_id, ?kind, "no usable outdoor reading; cycle discarded");
                return None;
            };

            let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
            let rate = delta / hours;
            let samples = inner.history.push(zone_id, kind, RateSample { outdoor, rate });
            debug!(
                zone = zone_id,
                ?kind,
                rate,
                outdoor,
                sunny = cycle.sunny,
                samples,
                "learning sample recorded"
            );
            (rate, samples, inner.history.to_blob())
        };

        if let Err(e) = self.storage.save(&blob).await {
            warn!(zone = zone_id, error = %e, "failed to persist learning history");
        }
        let _ = self.events.send(Event::LearningUpdated {
            zone_id: zone_id.to_string(),
            kind,
            observed_rate: rate,
            samples,
        });
        Some(rate)
    }

    fn regression(&self, kind: CycleKind, zone_id: &str) -> Option<Regression> {
        let inner = self.inner.lock();
        Regression::fit(inner.history.samples(zone_id, kind)?)
    }

    fn predict(&self, kind: CycleKind, zone_id: &str, outdoor: Option<f64>) -> f64 {
        let Some(outdoor) = outdoor.filter(|t| t.is_finite()) else {
            return default_rate(kind);
        };
        match self.regression(kind, zone_id) {
            Some(fit) => fit.predict(outdoor).clamp(MIN_RATE, MAX_RATE),
            None => default_rate(kind),
        }
    }
}
