use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::PlantConfig;
use crate::learning::ThermalLearningEngine;
use crate::schedule::{CalendarDecision, ScheduleRequest};
use crate::service::ServiceBus;
use crate::storage::Storage;
use crate::supervisor::{BoilerSupervisor, SupervisorSnapshot};
use crate::timer::earliest;
use crate::types::{Event, HvacMode};
use crate::zone::{ZoneController, ZoneSnapshot};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PlantSnapshot {
    pub supervisor: SupervisorSnapshot,
    pub zones: Vec<ZoneSnapshot>,
}

/// One boiler, its zones and the shared learning engine, wired together.
pub struct Plant<H, S> {
    config: PlantConfig,
    supervisor: Arc<BoilerSupervisor<H>>,
    learning: Arc<ThermalLearningEngine<S>>,
    zones: Vec<ZoneController<H, S>>,
    events: broadcast::Sender<Event>,
    started: bool,
}

impl<H: ServiceBus, S: Storage> Plant<H, S> {
    pub fn new(config: PlantConfig, host: Arc<H>, storage: S) -> Result<Self> {
        Self::with_breaker(config, host, storage, CircuitBreaker::default())
    }

    pub fn with_breaker(config: PlantConfig, host: Arc<H>, storage: S, breaker: CircuitBreaker) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = Arc::new(BoilerSupervisor::with_breaker(
            host.clone(),
            &config,
            events.clone(),
            breaker,
        ));
        let learning = Arc::new(ThermalLearningEngine::new(storage, events.clone()));
        let zones = config
            .zones
            .iter()
            .cloned()
            .map(|zone| {
                ZoneController::new(
                    zone,
                    &config,
                    host.clone(),
                    supervisor.clone(),
                    learning.clone(),
                    events.clone(),
                )
            })
            .collect();
        Ok(Self {
            config,
            supervisor,
            learning,
            zones,
            events,
            started: false,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &PlantConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<BoilerSupervisor<H>> {
        &self.supervisor
    }

    pub fn learning(&self) -> &Arc<ThermalLearningEngine<S>> {
        &self.learning
    }

    pub fn zones(&self) -> &[ZoneController<H, S>] {
        &self.zones
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneController<H, S>> {
        self.zones.iter().find(|z| z.id() == zone_id)
    }

    fn zone_mut(&mut self, zone_id: &str) -> Result<&mut ZoneController<H, S>> {
        self.zones
            .iter_mut()
            .find(|z| z.id() == zone_id)
            .ok_or_else(|| Error::UnknownZone(zone_id.to_string()))
    }

    /// Load learning history, force the boiler off and start every zone.
    pub async fn start(&mut self, now: DateTime<Utc>) {
        if self.started {
            return;
        }
        self.started = true;
        self.learning.load().await;
        self.supervisor.force_off(now).await;
        for zone in &mut self.zones {
            zone.startup(now).await;
        }
        info!(zones = self.zones.len(), boiler = %self.config.boiler_entity, "heating plant started");
    }

    /// Zone id a schedule request refers to: `area_id` when given, else a
    /// case-insensitive `area_name` match.
    pub fn resolve_area(&self, request: &ScheduleRequest) -> Option<&str> {
        if let Some(id) = request.area_id.as_deref().filter(|id| !id.is_empty()) {
            return self.zone(id).map(|z| z.id());
        }
        let name = request.area_name.as_deref()?.to_lowercase();
        self.zones
            .iter()
            .find(|z| z.name().to_lowercase() == name)
            .map(|z| z.id())
    }

    /// Route a set-schedule command. Unknown areas are ignored with a
    /// warning; returns whether a zone took the request.
    pub async fn handle_schedule(&mut self, request: ScheduleRequest, now: DateTime<Utc>) -> bool {
        let Some(zone_id) = self.resolve_area(&request).map(str::to_string) else {
            warn!(area_id = ?request.area_id, area_name = ?request.area_name, "schedule update ignored: unknown area");
            return false;
        };
        let Ok(zone) = self.zone_mut(&zone_id) else {
            return false;
        };
        zone.handle_schedule(request.target, request.effective_at, now)
            .await;
        true
    }

    pub async fn set_temperature(&mut self, zone_id: &str, temperature: f64, now: DateTime<Utc>) -> Result<()> {
        self.zone_mut(zone_id)?
            .set_temperature(temperature, now)
            .await;
        Ok(())
    }

    pub async fn set_hvac_mode(&mut self, zone_id: &str, mode: HvacMode, now: DateTime<Utc>) -> Result<()> {
        self.zone_mut(zone_id)?.set_hvac_mode(mode, now).await;
        Ok(())
    }

    pub async fn handle_calendar_decision(
        &mut self,
        zone_id: &str,
        decision: CalendarDecision,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.zone_mut(zone_id)?
            .handle_calendar_decision(decision, now)
            .await;
        Ok(())
    }

    /// Exercise one zone's valves now instead of waiting for the weekly slot.
    pub async fn exercise_valves(&mut self, zone_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.zone_mut(zone_id)?.start_valve_exercise(now).await;
        Ok(())
    }

    /// Route one changed entity to whoever watches it.
    pub async fn handle_state_change(&mut self, entity_id: &str, now: DateTime<Utc>) {
        if entity_id == self.config.master_switch {
            info!(entity = entity_id, "master heating switch changed");
            self.supervisor.recalculate(now).await;
            for zone in &mut self.zones {
                zone.apply_output(true, now).await;
            }
            return;
        }
        let mut routed = false;
        for zone in &mut self.zones {
            routed |= zone.handle_state_change(entity_id, now).await;
        }
        if !routed {
            debug!(entity = entity_id, "state change not watched by any zone");
        }
    }

    pub async fn handle_state_changes<I, T>(&mut self, entity_ids: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        for id in entity_ids {
            self.handle_state_change(id.as_ref(), now).await;
        }
    }

    /// Fire every due timer across zones and the supervisor.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        for zone in &mut self.zones {
            zone.tick(now).await;
        }
        self.supervisor.tick(now).await;
    }

    pub async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let supervisor = self.supervisor.next_wakeup().await;
        earliest(
            self.zones
                .iter()
                .map(|z| z.next_wakeup())
                .chain(std::iter::once(supervisor)),
        )
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> PlantSnapshot {
        PlantSnapshot {
            supervisor: self.supervisor.snapshot().await,
            zones: self.zones.iter().map(|z| z.snapshot(now)).collect(),
        }
    }

    /// Cancel every timer. The boiler is left as it is.
    pub async fn shutdown(&mut self) {
        for zone in &mut self.zones {
            zone.teardown();
        }
        self.supervisor.shutdown().await;
        self.started = false;
        info!("heating plant stopped");
    }
}
