use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, NaiveTime, TimeDelta, Utc, Weekday};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::commands::{CommandExecutor, CommandRecord, TrvCommand};
use crate::config::{PlantConfig, ZoneConfig};
use crate::detectors::window::WindowChange;
use crate::detectors::{PresenceDetector, PresenceState, WindowDetector, WindowState};
use crate::heating::{calculate_compensation, compute_preheat_start};
use crate::learning::{Regression, ThermalLearningEngine};
use crate::schedule::{CalendarDecision, ScheduleSignatures};
use crate::service::{ServiceBus, ServiceCall};
use crate::states::{STATE_OFF, STATE_ON};
use crate::storage::Storage;
use crate::supervisor::BoilerSupervisor;
use crate::target::{
    ManualRequest, ModeInputs, TargetContext, TargetMode, classify_manual_request, select_mode,
};
use crate::timer::{Timer, earliest};
use crate::types::{Event, HealthStatus, HvacAction, HvacMode, ZoneEvent};

pub const BOOST_MINUTES: i64 = 90;
pub const OUTPUT_DEBOUNCE_SECS: i64 = 5;
pub const OUTPUT_RETRY_SECS: i64 = 30;
pub const TRV_WARNING_MINUTES: i64 = 10;
pub const HEALTH_CHECK_MINUTES: i64 = 15;
/// Battery percentage below which the zone locks into failsafe.
pub const BATTERY_THRESHOLD_PCT: f64 = 5.0;
/// Temperature commanded to TRVs, and reported as target, under battery lock.
pub const FAILSAFE_TEMP_C: f64 = 15.0;
pub const VALVE_EXERCISE_HIGH_C: f64 = 30.0;
pub const VALVE_EXERCISE_LOW_C: f64 = 5.0;
pub const VALVE_EXERCISE_STEP_SECS: i64 = 120;
pub const DEMAND_HYSTERESIS_C: f64 = 0.1;

const HEATING_STALL_HOURS: i64 = 2;
const HEATING_STALL_RISE_C: f64 = 0.2;
const IDLE_LEAK_HOURS: i64 = 1;
const IDLE_LEAK_RISE_C: f64 = 1.0;

/// How the zone currently reacts to requests and output updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMode {
    Operational,
    /// A battery is critically low: user requests are ignored and TRVs are
    /// held at [`FAILSAFE_TEMP_C`].
    BatteryCritical,
    /// Valve exercise in progress; output application is suspended.
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExerciseStep {
    High,
    Low,
}

/// A target that takes effect at a given time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledTarget {
    pub target: f64,
    pub effective_at: DateTime<Utc>,
}

/// Mutable per-zone state. Only [`ZoneController`] writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRuntimeState {
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<f64>,
    pub schedule_target: Option<f64>,
    pub override_mode: Option<TargetMode>,
    pub preheat: Option<ScheduledTarget>,
    pub pending: Option<ScheduledTarget>,
    pub battery_lock: bool,
    pub user_hvac_off: bool,
    pub demand: bool,
    pub demand_since: Option<DateTime<Utc>>,
    pub demand_start_temp: Option<f64>,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_start_temp: Option<f64>,
    pub health: HealthStatus,
}

impl Default for ZoneRuntimeState {
    fn default() -> Self {
        Self {
            current_temperature: None,
            current_humidity: None,
            schedule_target: None,
            override_mode: None,
            preheat: None,
            pending: None,
            battery_lock: false,
            user_hvac_off: false,
            demand: false,
            demand_since: None,
            demand_start_temp: None,
            idle_since: None,
            idle_start_temp: None,
            health: HealthStatus::Ok,
        }
    }
}

/// Point-in-time view of a zone, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ZoneSnapshot {
    pub zone_id: String,
    pub name: String,
    pub mode: ZoneMode,
    pub hvac_mode: HvacMode,
    pub hvac_action: HvacAction,
    pub target_mode: &'static str,
    pub target_temperature: f64,
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<f64>,
    pub schedule_target: Option<f64>,
    pub demand: bool,
    pub battery_lock: bool,
    pub health: HealthStatus,
    pub window: WindowState,
    pub presence: PresenceState,
    pub preheating: bool,
    pub next_schedule: Option<ScheduledTarget>,
    pub active_trvs: Vec<String>,
    pub heating_rate: f64,
    pub cooling_rate: f64,
    pub heating_regression: Option<Regression>,
    pub cooling_regression: Option<Regression>,
    pub commands: Vec<CommandRecord>,
}

#[derive(Debug, Clone)]
struct ZoneSettings {
    off_temp: f64,
    comfort_temp: f64,
    eco_temp: f64,
    eco_number: String,
    master_switch: String,
    weather_entity: Option<String>,
    valve_maintenance: bool,
    maintenance_day: Weekday,
    maintenance_time: NaiveTime,
}

#[derive(Debug, Default)]
struct ZoneTimers {
    boost: Timer,
    preheat_start: Timer,
    preheat_apply: Timer,
    output_debounce: Timer,
    output_retry: Timer,
    exercise_step: Timer,
    maintenance: Timer,
    health: Timer,
}

impl ZoneTimers {
    fn deadlines(&self) -> [Option<DateTime<Utc>>; 8] {
        [
            self.boost.deadline(),
            self.preheat_start.deadline(),
            self.preheat_apply.deadline(),
            self.output_debounce.deadline(),
            self.output_retry.deadline(),
            self.exercise_step.deadline(),
            self.maintenance.deadline(),
            self.health.deadline(),
        ]
    }

    fn cancel_all(&mut self) {
        *self = Self::default();
    }
}

/// Next weekly maintenance slot strictly after `now` (UTC).
pub fn next_maintenance_after(now: DateTime<Utc>, day: Weekday, time: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive();
    for offset in 0..=7 {
        let date = today + Days::new(offset);
        if date.weekday() != day {
            continue;
        }
        let at = date.and_time(time).and_utc();
        if at > now {
            return at;
        }
    }
    (today + Days::new(7)).and_time(time).and_utc()
}

/// Owns one zone: reads its sensors, picks a target, drives its TRVs and
/// reports demand to the shared [`BoilerSupervisor`].
///
/// All delayed work is held as [`Timer`]s and run from [`tick`](Self::tick).
pub struct ZoneController<H, S> {
    config: ZoneConfig,
    schedule_entity: String,
    settings: ZoneSettings,
    host: Arc<H>,
    supervisor: Arc<BoilerSupervisor<H>>,
    learning: Arc<ThermalLearningEngine<S>>,
    events: broadcast::Sender<Event>,
    window: WindowDetector,
    presence: PresenceDetector,
    calendar: ScheduleSignatures,
    executor: CommandExecutor,
    state: ZoneRuntimeState,
    timers: ZoneTimers,
    exercise: Option<ExerciseStep>,
    last_trv_warning: Option<DateTime<Utc>>,
    started: bool,
}

impl<H: ServiceBus, S: Storage> ZoneController<H, S> {
    pub fn new(
        config: ZoneConfig,
        plant: &PlantConfig,
        host: Arc<H>,
        supervisor: Arc<BoilerSupervisor<H>>,
        learning: Arc<ThermalLearningEngine<S>>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let slug = config.slug();
        let window = WindowDetector::new(config.window_sensors.clone(), plant.window_threshold);
        let presence = PresenceDetector::new(
            &config.name,
            &slug,
            config.presence_sensors.clone(),
            config.distance_sensors.clone(),
            plant.proximity_threshold,
            &plant.guest_switch,
            &plant.home_zone,
        );
        Self {
            schedule_entity: config.schedule_entity(),
            settings: ZoneSettings {
                off_temp: plant.off_temp,
                comfort_temp: plant.comfort_temp,
                eco_temp: plant.eco_temp,
                eco_number: plant.eco_number.clone(),
                master_switch: plant.master_switch.clone(),
                weather_entity: plant.weather_entity.clone(),
                valve_maintenance: plant.valve_maintenance,
                maintenance_day: plant.maintenance_day,
                maintenance_time: plant.maintenance_time,
            },
            config,
            host,
            supervisor,
            learning,
            events,
            window,
            presence,
            calendar: ScheduleSignatures::new(),
            executor: CommandExecutor::default(),
            state: ZoneRuntimeState::default(),
            timers: ZoneTimers::default(),
            exercise: None,
            last_trv_warning: None,
            started: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn runtime(&self) -> &ZoneRuntimeState {
        &self.state
    }

    pub fn mode(&self) -> ZoneMode {
        if self.state.battery_lock {
            ZoneMode::BatteryCritical
        } else if self.exercise.is_some() {
            ZoneMode::Maintenance
        } else {
            ZoneMode::Operational
        }
    }

    pub fn window(&self) -> &WindowDetector {
        &self.window
    }

    pub fn presence(&self) -> &PresenceDetector {
        &self.presence
    }

    pub fn demand(&self) -> bool {
        self.state.demand
    }

    pub fn health(&self) -> HealthStatus {
        self.state.health
    }

    /// Load inputs, arm periodic timers and push the first output.
    pub async fn startup(&mut self, now: DateTime<Utc>) {
        if self.started {
            return;
        }
        self.started = true;

        self.load_schedule_target();
        self.presence.refresh(self.host.as_ref());
        self.window.refresh(self.host.as_ref());
        self.refresh_battery();
        self.update_current_temperature(now);
        self.update_current_humidity();

        self.timers
            .health
            .arm(now + TimeDelta::minutes(HEALTH_CHECK_MINUTES));
        if self.settings.valve_maintenance {
            self.timers.maintenance.arm(next_maintenance_after(
                now,
                self.settings.maintenance_day,
                self.settings.maintenance_time,
            ));
        }
        info!(zone = %self.config.id, schedule = ?self.state.schedule_target, "zone started");
        self.apply_output(true, now).await;
    }

    /// Manual target request; installs a Boost or Save override relative to
    /// the schedule, or clears the override when equal.
    pub async fn set_temperature(&mut self, temperature: f64, now: DateTime<Utc>) {
        if !temperature.is_finite() {
            debug!(zone = %self.config.id, "non-finite temperature request ignored");
            return;
        }
        if self.mode() == ZoneMode::BatteryCritical {
            warn!(zone = %self.config.id, "battery failsafe active; ignoring manual override");
            return;
        }
        let schedule = self.state.schedule_target.unwrap_or(self.settings.off_temp);
        info!(zone = %self.config.id, requested = temperature, schedule, "manual target request");
        self.calendar.suppress_last();
        match classify_manual_request(temperature, schedule) {
            ManualRequest::Boost(target) => self.set_boost_override(target, now),
            ManualRequest::Save(target) => self.set_save_override(target),
            ManualRequest::Clear => self.clear_override(),
        }
        self.apply_output(true, now).await;
    }

    pub async fn set_hvac_mode(&mut self, mode: HvacMode, now: DateTime<Utc>) {
        if self.mode() == ZoneMode::BatteryCritical {
            warn!(zone = %self.config.id, "battery failsafe active; ignoring HVAC mode change");
            return;
        }
        self.state.user_hvac_off = mode == HvacMode::Off;
        if self.state.user_hvac_off {
            info!(zone = %self.config.id, "HVAC turned off");
            self.cancel_preheat();
        }
        self.apply_output(true, now).await;
    }

    /// New schedule value. A future `effective_at` is queued (with preheat);
    /// otherwise it applies now and drops any Save override.
    pub async fn handle_schedule(&mut self, target: f64, effective_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        if !target.is_finite() {
            debug!(zone = %self.config.id, "non-finite schedule target ignored");
            return;
        }
        if self.state.battery_lock {
            warn!(zone = %self.config.id, "battery failsafe active; ignoring schedule update");
            return;
        }
        info!(zone = %self.config.id, target, ?effective_at, "schedule update");
        self.calendar.suppress_last();
        if let Some(at) = effective_at
            && at > now
        {
            self.schedule_future_target(target, at, now).await;
            return;
        }
        self.state.schedule_target = Some(target);
        self.cancel_preheat();
        if matches!(self.state.override_mode, Some(TargetMode::Save(_))) {
            self.clear_override();
        }
        self.apply_output(true, now).await;
    }

    /// Apply a calendar lookup: an active event sets the schedule now, an
    /// upcoming one is queued once. An inactive event whose start has
    /// already passed applies immediately.
    pub async fn handle_calendar_decision(&mut self, decision: CalendarDecision, now: DateTime<Utc>) {
        if self.state.battery_lock {
            return;
        }
        if decision.is_active {
            if self.state.schedule_target != Some(decision.target) {
                info!(zone = %self.config.id, target = decision.target, "active calendar event");
                self.apply_future_target(decision.target, now).await;
            }
            return;
        }
        if !self.calendar.accept(&decision) {
            debug!(zone = %self.config.id, start = %decision.start, "calendar event already handled");
            return;
        }
        self.schedule_future_target(decision.target, decision.start, now).await;
    }

    /// React to a changed entity. Returns whether the zone cares about it.
    pub async fn handle_state_change(&mut self, entity_id: &str, now: DateTime<Utc>) -> bool {
        let mut relevant = false;
        if self.config.temp_sensors.iter().any(|e| e == entity_id)
            || self.config.trvs.iter().any(|e| e == entity_id)
        {
            self.update_current_temperature(now);
            relevant = true;
        } else if self.config.humidity_sensors.iter().any(|e| e == entity_id) {
            self.update_current_humidity();
            relevant = true;
        } else if self.config.battery_sensors.iter().any(|e| e == entity_id) {
            if !self.refresh_battery() {
                return true;
            }
            relevant = true;
        }
        if self.window.handles(entity_id) {
            self.window.refresh(self.host.as_ref());
            relevant = true;
        }
        if self.presence.handles(entity_id) {
            self.presence.refresh(self.host.as_ref());
            relevant = true;
        }
        if entity_id == self.settings.master_switch || entity_id == self.settings.eco_number {
            relevant = true;
        }
        if !relevant {
            return false;
        }
        debug!(zone = %self.config.id, entity = entity_id, "state change");
        self.schedule_output_update(false, false, now).await;
        true
    }

    /// Run every zone timer that is due.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        if self.window.tick(now) == WindowChange::HoldCleared {
            self.emit(ZoneEvent::WindowHoldCleared);
            self.schedule_output_update(false, false, now).await;
        }
        if self.timers.boost.fire(now) {
            info!(zone = %self.config.id, "boost expired");
            self.state.override_mode = None;
            self.schedule_output_update(true, true, now).await;
        }
        if self.timers.preheat_start.fire(now)
            && let Some(pending) = self.state.pending
        {
            self.start_preheat(pending, now).await;
        }
        if self.timers.preheat_apply.fire(now)
            && let Some(pending) = self.state.pending
        {
            self.apply_future_target(pending.target, now).await;
        }
        if self.timers.exercise_step.fire(now) {
            self.advance_valve_exercise(now).await;
        }
        if self.timers.maintenance.fire(now) {
            self.timers.maintenance.arm(next_maintenance_after(
                now,
                self.settings.maintenance_day,
                self.settings.maintenance_time,
            ));
            self.start_valve_exercise(now).await;
        }
        if self.timers.health.fire(now) {
            self.timers
                .health
                .arm(now + TimeDelta::minutes(HEALTH_CHECK_MINUTES));
            self.check_health(now);
        }
        if self.timers.output_retry.fire(now) {
            self.apply_output(true, now).await;
        }
        if self.timers.output_debounce.fire(now) {
            self.apply_output(false, now).await;
        }
    }

    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let mut deadlines = self.timers.deadlines().to_vec();
        deadlines.push(self.window.next_wakeup());
        earliest(deadlines)
    }

    /// Cancel every timer and drop open learning cycles.
    pub fn teardown(&mut self) {
        self.timers.cancel_all();
        self.window.teardown();
        self.exercise = None;
        self.state.preheat = None;
        self.state.pending = None;
        self.learning.abandon_cycles(&self.config.id);
        debug!(zone = %self.config.id, "zone torn down");
    }

    /// Run the two-step valve exercise now, unless heating, locked or
    /// already running. `valve_maintenance` only gates the weekly slot.
    pub async fn start_valve_exercise(&mut self, now: DateTime<Utc>) {
        if self.state.battery_lock {
            return;
        }
        if self.hvac_action(now) == HvacAction::Heating {
            debug!(zone = %self.config.id, "zone is heating; valve exercise skipped");
            return;
        }
        if self.exercise.is_some() {
            return;
        }
        info!(zone = %self.config.id, "valve exercise started");
        self.exercise = Some(ExerciseStep::High);
        self.set_trvs_temp(VALVE_EXERCISE_HIGH_C, now).await;
        self.timers
            .exercise_step
            .arm(now + TimeDelta::seconds(VALVE_EXERCISE_STEP_SECS));
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_mode().final_target(&self.target_context())
    }

    pub fn target_mode(&self) -> TargetMode {
        select_mode(&ModeInputs {
            battery_lock: self.state.battery_lock.then_some(FAILSAFE_TEMP_C),
            manual_override: self.state.override_mode,
            preheat_target: self.state.preheat.map(|p| p.target),
            occupied: self.presence.is_occupied(self.host.as_ref()),
        })
    }

    pub fn hvac_mode(&self, now: DateTime<Utc>) -> HvacMode {
        if self.is_forced_off(now) {
            HvacMode::Off
        } else {
            HvacMode::Heat
        }
    }

    pub fn hvac_action(&self, now: DateTime<Utc>) -> HvacAction {
        if self.hvac_mode(now) == HvacMode::Off {
            HvacAction::Off
        } else if self.state.demand {
            HvacAction::Heating
        } else {
            HvacAction::Idle
        }
    }

    /// Master off, user off or window open/hold. Never true under battery
    /// lock.
    pub fn is_forced_off(&self, now: DateTime<Utc>) -> bool {
        if self.state.battery_lock {
            return false;
        }
        !self.is_master_enabled()
            || self.state.user_hvac_off
            || self.window.is_forced_off(now)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ZoneSnapshot {
        let mode = self.target_mode();
        let outdoor = self.outdoor_temperature();
        ZoneSnapshot {
            zone_id: self.config.id.clone(),
            name: self.config.name.clone(),
            mode: self.mode(),
            hvac_mode: self.hvac_mode(now),
            hvac_action: self.hvac_action(now),
            target_mode: mode.name(),
            target_temperature: mode.final_target(&self.target_context()),
            current_temperature: self.state.current_temperature,
            current_humidity: self.state.current_humidity,
            schedule_target: self.state.schedule_target,
            demand: self.state.demand,
            battery_lock: self.state.battery_lock,
            health: self.state.health,
            window: self.window.state(),
            presence: self.presence.state(),
            preheating: self.state.preheat.is_some(),
            next_schedule: self.state.pending,
            active_trvs: self.valid_trvs(),
            heating_rate: self.learning.rate(&self.config.id, outdoor),
            cooling_rate: self.learning.cooling_rate(&self.config.id, outdoor),
            heating_regression: self.learning.heating_regression(&self.config.id),
            cooling_regression: self.learning.cooling_regression(&self.config.id),
            commands: self.executor.history().cloned().collect(),
        }
    }

    /// Push target and mode to the TRVs, then report demand.
    pub async fn apply_output(&mut self, immediate_demand: bool, now: DateTime<Utc>) {
        match self.mode() {
            ZoneMode::Maintenance => {}
            ZoneMode::BatteryCritical => {
                let valid = self.valid_trvs();
                if !self.config.trvs.is_empty() && valid.is_empty() {
                    self.warn_no_trvs(now);
                    self.timers
                        .output_retry
                        .arm_if_idle(now + TimeDelta::seconds(OUTPUT_RETRY_SECS));
                } else {
                    self.timers.output_retry.cancel();
                    self.send_trvs(TrvCommand::new(valid, HvacMode::Heat, FAILSAFE_TEMP_C), now)
                        .await;
                }
                self.update_demand(None, immediate_demand, now).await;
            }
            ZoneMode::Operational => {
                let valid = self.valid_trvs();
                let target = self.target_temperature();
                let forced_off = self.is_forced_off(now);
                debug!(zone = %self.config.id, target, forced_off, trvs = ?valid, "applying output");

                if !self.config.trvs.is_empty() {
                    if valid.is_empty() {
                        self.warn_no_trvs(now);
                        self.timers
                            .output_retry
                            .arm_if_idle(now + TimeDelta::seconds(OUTPUT_RETRY_SECS));
                    } else {
                        self.timers.output_retry.cancel();
                        let command = if forced_off {
                            TrvCommand::new(valid, HvacMode::Off, self.settings.off_temp)
                        } else {
                            TrvCommand::new(valid, HvacMode::Heat, self.trv_setpoint(target))
                        };
                        self.send_trvs(command, now).await;
                    }
                }
                self.update_demand(Some(target), immediate_demand, now).await;
            }
        }
        self.emit(ZoneEvent::Updated);
    }

    fn trv_setpoint(&self, target: f64) -> f64 {
        if self.config.temp_sensors.is_empty() {
            return target;
        }
        let Some(current) = self.state.current_temperature else {
            return target;
        };
        let compensation = calculate_compensation(target, current);
        debug!(
            zone = %self.config.id,
            current,
            target,
            error = compensation.error,
            sent = compensation.clamped,
            "compensated TRV setpoint"
        );
        compensation.clamped
    }

    async fn schedule_output_update(&mut self, immediate: bool, immediate_demand: bool, now: DateTime<Utc>) {
        if immediate {
            self.timers.output_debounce.cancel();
            self.apply_output(immediate_demand, now).await;
            return;
        }
        if self
            .timers
            .output_debounce
            .arm_if_idle(now + TimeDelta::seconds(OUTPUT_DEBOUNCE_SECS))
        {
            debug!(zone = %self.config.id, secs = OUTPUT_DEBOUNCE_SECS, "debouncing output update");
        }
    }

    async fn update_demand(&mut self, target: Option<f64>, immediate: bool, now: DateTime<Utc>) {
        let current = self.state.current_temperature;
        let demand = !self.is_forced_off(now)
            && matches!((target, current), (Some(t), Some(c)) if c + DEMAND_HYSTERESIS_C < t);

        if demand != self.state.demand {
            debug!(
                zone = %self.config.id,
                from = self.state.demand,
                to = demand,
                ?target,
                ?current,
                "demand change"
            );
            if let Some(temp) = current {
                let outdoor = self.outdoor_temperature();
                let sunny = self.is_sunny();
                let id = self.config.id.as_str();
                if demand {
                    self.learning.end_cooling_cycle(id, temp, now).await;
                    self.learning.start_cycle(id, temp, outdoor, sunny, now);
                } else {
                    self.learning.end_cycle(id, temp, now).await;
                    self.learning.start_cooling_cycle(id, temp, outdoor, sunny, now);
                }
            }
            if demand {
                self.state.demand_since = Some(now);
                self.state.demand_start_temp = current;
                self.state.idle_since = None;
                self.state.idle_start_temp = None;
            } else {
                self.state.idle_since = Some(now);
                self.state.idle_start_temp = current;
                self.state.demand_since = None;
                self.state.demand_start_temp = None;
            }
            self.state.demand = demand;
        } else if let Some(temp) = current {
            if demand && self.state.demand_since.is_none() {
                self.state.demand_since = Some(now);
                self.state.demand_start_temp = Some(temp);
            } else if !demand && self.state.idle_since.is_none() {
                self.state.idle_since = Some(now);
                self.state.idle_start_temp = Some(temp);
            }
        }

        self.supervisor
            .update_demand(&self.config.id, demand, immediate, now)
            .await;
        self.check_health(now);
    }

    fn check_health(&mut self, now: DateTime<Utc>) {
        let health = match self.state.current_temperature {
            None => HealthStatus::Ok,
            Some(current) if self.state.demand => match (self.state.demand_since, self.state.demand_start_temp) {
                (Some(since), Some(start))
                    if now - since >= TimeDelta::hours(HEATING_STALL_HOURS)
                        && current - start < HEATING_STALL_RISE_C =>
                {
                    HealthStatus::PossibleActuatorFailure
                }
                _ => HealthStatus::Ok,
            },
            Some(current) => match (self.state.idle_since, self.state.idle_start_temp) {
                (Some(since), Some(start))
                    if now - since >= TimeDelta::hours(IDLE_LEAK_HOURS) && current - start > IDLE_LEAK_RISE_C =>
                {
                    HealthStatus::ValveStuckOpen
                }
                _ => HealthStatus::Ok,
            },
        };
        if health == self.state.health {
            return;
        }
        self.state.health = health;
        if health != HealthStatus::Ok {
            warn!(zone = %self.config.id, status = health.as_str(), "zone health problem detected");
            self.emit(ZoneEvent::Failure { status: health });
        }
        self.emit(ZoneEvent::HealthChanged { status: health });
    }

    async fn schedule_future_target(&mut self, target: f64, effective_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.cancel_preheat();
        let pending = ScheduledTarget { target, effective_at };
        if effective_at <= now {
            self.state.schedule_target = Some(target);
            self.apply_output(true, now).await;
            return;
        }
        self.state.pending = Some(pending);
        self.timers.preheat_apply.arm(effective_at);

        let allow_preheat = self.presence.is_occupied(self.host.as_ref());
        let rate = if allow_preheat {
            self.learning.rate(&self.config.id, self.outdoor_temperature())
        } else {
            0.0
        };
        let Some(start_at) = compute_preheat_start(
            self.state.current_temperature,
            target,
            effective_at,
            rate,
            allow_preheat,
        ) else {
            debug!(zone = %self.config.id, target, %effective_at, "future target queued without preheat");
            return;
        };
        debug!(zone = %self.config.id, target, %effective_at, %start_at, rate, "future target queued");
        if start_at <= now {
            self.start_preheat(pending, now).await;
            return;
        }
        self.timers.preheat_start.arm(start_at);
    }

    async fn start_preheat(&mut self, pending: ScheduledTarget, now: DateTime<Utc>) {
        if now >= pending.effective_at || self.state.battery_lock || self.state.override_mode.is_some() {
            return;
        }
        if self
            .state
            .current_temperature
            .is_some_and(|current| pending.target <= current)
        {
            return;
        }
        info!(zone = %self.config.id, target = pending.target, until = %pending.effective_at, "preheat started");
        self.state.preheat = Some(pending);
        self.emit(ZoneEvent::PreheatStarted { target: pending.target });
        self.apply_output(true, now).await;
    }

    async fn apply_future_target(&mut self, target: f64, now: DateTime<Utc>) {
        self.state.preheat = None;
        self.state.pending = None;
        self.timers.preheat_start.cancel();
        self.timers.preheat_apply.cancel();
        self.state.schedule_target = Some(target);

        let call = ServiceCall::set_number(&self.schedule_entity, target);
        let name = format!("schedule_target({})", self.schedule_entity);
        if let Err(e) = self.executor.execute(&name, now, self.host.call(call)).await {
            warn!(zone = %self.config.id, entity = %self.schedule_entity, error = %e, "failed to store schedule target");
        }
        self.apply_output(true, now).await;
    }

    fn cancel_preheat(&mut self) {
        self.timers.preheat_start.cancel();
        self.timers.preheat_apply.cancel();
        self.state.preheat = None;
        self.state.pending = None;
    }

    fn set_boost_override(&mut self, target: f64, now: DateTime<Utc>) {
        self.cancel_preheat();
        self.state.override_mode = Some(TargetMode::Boost(target));
        self.timers.boost.arm(now + TimeDelta::minutes(BOOST_MINUTES));
    }

    fn set_save_override(&mut self, target: f64) {
        self.cancel_preheat();
        self.timers.boost.cancel();
        self.state.override_mode = Some(TargetMode::Save(target));
    }

    fn clear_override(&mut self) {
        self.timers.boost.cancel();
        self.state.override_mode = None;
    }

    async fn advance_valve_exercise(&mut self, now: DateTime<Utc>) {
        match self.exercise {
            Some(ExerciseStep::High) => {
                self.exercise = Some(ExerciseStep::Low);
                self.set_trvs_temp(VALVE_EXERCISE_LOW_C, now).await;
                self.timers
                    .exercise_step
                    .arm(now + TimeDelta::seconds(VALVE_EXERCISE_STEP_SECS));
            }
            Some(ExerciseStep::Low) => {
                self.exercise = None;
                info!(zone = %self.config.id, "valve exercise finished");
                self.apply_output(true, now).await;
            }
            None => {}
        }
    }

    async fn set_trvs_temp(&mut self, temperature: f64, now: DateTime<Utc>) {
        if self.config.trvs.is_empty() {
            return;
        }
        let valid = self.valid_trvs();
        if valid.is_empty() {
            self.warn_no_trvs(now);
            return;
        }
        self.send_trvs(TrvCommand::new(valid, HvacMode::Heat, temperature), now)
            .await;
    }

    async fn send_trvs(&mut self, command: TrvCommand, now: DateTime<Utc>) {
        if command.entities.is_empty() {
            return;
        }
        let name = command.describe();
        if let Err(e) = self
            .executor
            .execute(&name, now, command.send(self.host.as_ref()))
            .await
        {
            warn!(zone = %self.config.id, command = %name, error = %e, "TRV command failed; retrying");
            self.timers
                .output_retry
                .arm_if_idle(now + TimeDelta::seconds(OUTPUT_RETRY_SECS));
        }
    }

    fn refresh_battery(&mut self) -> bool {
        if self.config.battery_sensors.is_empty() {
            return false;
        }
        let low = self
            .config
            .battery_sensors
            .iter()
            .filter_map(|id| self.host.state_f64(id))
            .any(|level| level < BATTERY_THRESHOLD_PCT);

        if low && !self.state.battery_lock {
            self.state.battery_lock = true;
            self.cancel_preheat();
            self.exercise = None;
            self.timers.exercise_step.cancel();
            warn!(
                zone = %self.config.id,
                safety_temp = FAILSAFE_TEMP_C,
                "battery critically low; forcing TRVs to safety temperature"
            );
            self.emit(ZoneEvent::BatteryLockChanged { locked: true });
            return true;
        }
        if !low && self.state.battery_lock {
            self.state.battery_lock = false;
            self.load_schedule_target();
            info!(zone = %self.config.id, "battery failsafe cleared");
            self.emit(ZoneEvent::BatteryLockChanged { locked: false });
            return true;
        }
        false
    }

    fn load_schedule_target(&mut self) {
        self.state.schedule_target = Some(
            self.host
                .state_f64(&self.schedule_entity)
                .unwrap_or(self.settings.comfort_temp),
        );
    }

    fn update_current_temperature(&mut self, now: DateTime<Utc>) {
        let mut temps: Vec<f64> = self
            .config
            .temp_sensors
            .iter()
            .filter_map(|id| self.host.state_f64(id))
            .filter(|t| t.is_finite())
            .collect();
        if temps.is_empty() {
            temps = self
                .config
                .trvs
                .iter()
                .filter_map(|id| self.host.state(id))
                .filter_map(|s| s.attribute_f64("current_temperature"))
                .filter(|t| t.is_finite())
                .collect();
        }
        let Some(mean) = mean(&temps) else {
            return;
        };
        self.state.current_temperature = Some(mean);
        debug!(zone = %self.config.id, temperature = mean, "current temperature");
        if self.window.record_temperature(mean, now) == WindowChange::HoldStarted {
            info!(zone = %self.config.id, "window hold started");
            self.emit(ZoneEvent::WindowHoldStarted);
        }
    }

    fn update_current_humidity(&mut self) {
        let values: Vec<f64> = self
            .config
            .humidity_sensors
            .iter()
            .filter_map(|id| self.host.state_f64(id))
            .filter(|h| h.is_finite())
            .collect();
        self.state.current_humidity = mean(&values);
    }

    fn target_context(&self) -> TargetContext {
        TargetContext {
            schedule_target: self.state.schedule_target,
            off_temp: self.settings.off_temp,
            comfort_temp: self.settings.comfort_temp,
            eco_temp: self.eco_temp(),
            has_presence_sensors: self.presence.has_sensors(),
            presence_on: self.presence.is_present(),
        }
    }

    fn eco_temp(&self) -> f64 {
        self.host
            .state_f64(&self.settings.eco_number)
            .unwrap_or(self.settings.eco_temp)
    }

    /// Missing, unknown or unavailable means enabled.
    fn is_master_enabled(&self) -> bool {
        let Some(state) = self.host.state(&self.settings.master_switch) else {
            return true;
        };
        if !state.is_available() || state.state == STATE_ON {
            return true;
        }
        if state.state != STATE_OFF {
            warn!(state = %state.state, "master heating switch state is unexpected; treating as on");
            return true;
        }
        false
    }

    fn outdoor_temperature(&self) -> Option<f64> {
        let entity = self.settings.weather_entity.as_deref()?;
        self.host
            .state(entity)?
            .attribute_f64("temperature")
            .filter(|t| t.is_finite())
    }

    fn is_sunny(&self) -> bool {
        let Some(entity) = self.settings.weather_entity.as_deref() else {
            return false;
        };
        if self
            .host
            .state("sun.sun")
            .is_some_and(|s| s.state == "below_horizon")
        {
            return false;
        }
        let Some(weather) = self.host.state(entity) else {
            return false;
        };
        match weather.state.to_lowercase().as_str() {
            "clear-night" | "partlycloudy-night" => false,
            "sunny" => true,
            _ => weather
                .attribute_f64("cloud_coverage")
                .is_some_and(|coverage| coverage < 20.0),
        }
    }

    fn valid_trvs(&self) -> Vec<String> {
        self.config
            .trvs
            .iter()
            .filter(|id| {
                let reachable = self.host.state(id).is_some_and(|s| s.is_available());
                if !reachable {
                    debug!(zone = %self.config.id, trv = %id, "ignoring unreachable TRV");
                }
                reachable
            })
            .cloned()
            .collect()
    }

    fn warn_no_trvs(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_trv_warning
            .is_none_or(|last| now - last >= TimeDelta::minutes(TRV_WARNING_MINUTES));
        if due {
            warn!(zone = %self.config.id, "no reachable TRVs; cannot set heating");
            self.last_trv_warning = Some(now);
        }
    }

    fn emit(&self, event: ZoneEvent) {
        let _ = self.events.send(Event::Zone {
            zone_id: self.config.id.clone(),
            event,
        });
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
