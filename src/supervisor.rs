use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::commands::{BoilerDriver, CommandExecutor, CommandRecord};
use crate::config::PlantConfig;
use crate::service::ServiceBus;
use crate::states::{STATE_OFF, STATE_ON};
use crate::timer::{Timer, earliest};
use crate::types::{Event, SupervisorState};

pub const DEMAND_DEBOUNCE_SECS: i64 = 5;
pub const FAILSAFE_RETRY_SECS: i64 = 60;
pub const RETRY_MAX_SECS: i64 = 3600;

/// Zone demand waiting for the next flush.
#[derive(Debug, Default)]
struct PendingDemand {
    demand: HashMap<String, bool>,
    flush: Timer,
}

/// Everything `recalculate` mutates; guarded by the supervisor's async lock.
#[derive(Debug)]
struct Core {
    demand: HashMap<String, bool>,
    state: SupervisorState,
    cooldown_until: Option<DateTime<Utc>>,
    breaker: CircuitBreaker,
    retry: Timer,
    retry_attempts: u32,
    master_warned: bool,
    executor: CommandExecutor,
}

/// Point-in-time view of the supervisor, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub demand: HashMap<String, bool>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub retry_attempts: u32,
    pub breaker: BreakerState,
    pub commands: Vec<CommandRecord>,
}

impl SupervisorSnapshot {
    /// Logical OR over the flushed zone demand.
    pub fn heat_requested(&self) -> bool {
        self.demand.values().any(|d| *d)
    }
}

/// Drives the one shared heat source on behalf of every zone.
///
/// Zone demand is buffered and debounced, then OR-ed into a single on/off
/// decision. Turning on honours the anti-short-cycle cooldown and the circuit
/// breaker; turning off is never rate limited. Failed actuator calls put the
/// supervisor in `Failsafe` and schedule a retry with exponential backoff.
pub struct BoilerSupervisor<H> {
    host: Arc<H>,
    driver: BoilerDriver,
    master_switch: String,
    min_cycle: TimeDelta,
    pending: Mutex<PendingDemand>,
    core: tokio::sync::Mutex<Core>,
    events: broadcast::Sender<Event>,
}

impl<H: ServiceBus> BoilerSupervisor<H> {
    pub fn new(host: Arc<H>, config: &PlantConfig, events: broadcast::Sender<Event>) -> Self {
        Self::with_breaker(host, config, events, CircuitBreaker::default())
    }

    pub fn with_breaker(
        host: Arc<H>,
        config: &PlantConfig,
        events: broadcast::Sender<Event>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            host,
            driver: BoilerDriver::new(&config.boiler_entity, config.boost_temp, config.off_temp),
            master_switch: config.master_switch.clone(),
            min_cycle: TimeDelta::minutes(config.min_cycle),
            pending: Mutex::new(PendingDemand::default()),
            core: tokio::sync::Mutex::new(Core {
                demand: HashMap::new(),
                state: SupervisorState::Idle,
                cooldown_until: None,
                breaker,
                retry: Timer::new(),
                retry_attempts: 0,
                master_warned: false,
                executor: CommandExecutor::default(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Queue a zone's demand. Non-immediate updates are flushed by a single
    /// debounce timer armed by the first update; immediate updates cancel it
    /// and recalculate now.
    pub async fn update_demand(&self, zone_id: &str, demand: bool, immediate: bool, now: DateTime<Utc>) {
        {
            let mut pending = self.pending.lock();
            pending.demand.insert(zone_id.to_string(), demand);
            debug!(zone = zone_id, demand, immediate, "demand update queued");
            if !immediate {
                if pending
                    .flush
                    .arm_if_idle(now + TimeDelta::seconds(DEMAND_DEBOUNCE_SECS))
                {
                    debug!(secs = DEMAND_DEBOUNCE_SECS, "debouncing demand updates");
                }
                return;
            }
            pending.flush.cancel();
        }
        self.recalculate(now).await;
    }

    pub async fn recalculate(&self, now: DateTime<Utc>) -> SupervisorState {
        let mut core = self.core.lock().await;
        self.flush_pending(&mut core);

        match self.host.state(&self.master_switch) {
            Some(state) if state.is_available() && state.state == STATE_OFF => {
                info!("master heating switch is off; forcing boiler off");
                self.ensure_off(&mut core, true, now).await;
                return core.state;
            }
            Some(state) if state.is_available() && state.state != STATE_ON => {
                warn!(
                    state = %state.state,
                    "master heating switch state is unexpected; defaulting to heating enabled"
                );
            }
            Some(state) if state.is_available() => {}
            _ => {
                if !core.master_warned {
                    warn!(
                        entity = %self.master_switch,
                        "master heating switch is unavailable or unknown; defaulting to heating enabled"
                    );
                    core.master_warned = true;
                }
            }
        }

        self.update_cooldown(&mut core, now);
        if core.demand.values().any(|d| *d) {
            self.ensure_on(&mut core, now).await;
        } else {
            self.ensure_off(&mut core, false, now).await;
        }
        core.state
    }

    /// Force the boiler off and start the anti-cycle cooldown.
    pub async fn force_off(&self, now: DateTime<Utc>) -> SupervisorState {
        let mut core = self.core.lock().await;
        self.ensure_off(&mut core, true, now).await;
        core.state
    }

    /// Fire due debounce/retry timers.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let flush_due = self.pending.lock().flush.fire(now);
        let retry_due = self.core.lock().await.retry.fire(now);
        if flush_due || retry_due {
            if retry_due {
                debug!("boiler retry timer fired");
            }
            self.recalculate(now).await;
        }
    }

    pub async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let flush = self.pending.lock().flush.deadline();
        let retry = self.core.lock().await.retry.deadline();
        earliest([flush, retry])
    }

    pub async fn state(&self) -> SupervisorState {
        self.core.lock().await.state
    }

    pub async fn snapshot(&self) -> SupervisorSnapshot {
        let core = self.core.lock().await;
        SupervisorSnapshot {
            state: core.state,
            demand: core.demand.clone(),
            cooldown_until: core.cooldown_until,
            retry_at: core.retry.deadline(),
            retry_attempts: core.retry_attempts,
            breaker: core.breaker.state(),
            commands: core.executor.history().cloned().collect(),
        }
    }

    /// Cancel all timers; pending demand is dropped.
    pub async fn shutdown(&self) {
        {
            let mut pending = self.pending.lock();
            pending.flush.cancel();
            pending.demand.clear();
        }
        self.core.lock().await.retry.cancel();
    }

    fn flush_pending(&self, core: &mut Core) {
        let mut pending = self.pending.lock();
        pending.flush.cancel();
        if pending.demand.is_empty() {
            return;
        }
        let mut changed = false;
        for (zone, demand) in pending.demand.drain() {
            if core.demand.insert(zone, demand) != Some(demand) {
                changed = true;
            }
        }
        if changed {
            debug!(demand = ?core.demand, "demand map updated");
        }
    }

    fn set_state(&self, core: &mut Core, state: SupervisorState) {
        if core.state == state {
            return;
        }
        let previous = core.state;
        core.state = state;
        if state == SupervisorState::Failsafe {
            warn!(from = %previous, to = %state, "boiler state transition");
        } else {
            debug!(from = %previous, to = %state, "boiler state transition");
        }
        // No subscribers is fine; delivery is fire-and-forget.
        let _ = self.events.send(Event::BoilerStateChanged { state, previous });
    }

    fn cooldown_remaining(core: &Core, now: DateTime<Utc>) -> TimeDelta {
        match core.cooldown_until {
            Some(until) if until > now => until - now,
            _ => TimeDelta::zero(),
        }
    }

    fn enter_cooldown(&self, core: &mut Core, now: DateTime<Utc>) {
        if self.min_cycle <= TimeDelta::zero() {
            core.cooldown_until = None;
            self.set_state(core, SupervisorState::Idle);
            return;
        }
        core.cooldown_until = Some(now + self.min_cycle);
        self.set_state(core, SupervisorState::AntiCycleCooldown);
    }

    fn update_cooldown(&self, core: &mut Core, now: DateTime<Utc>) {
        match core.cooldown_until {
            None => {
                if core.state == SupervisorState::AntiCycleCooldown {
                    self.set_state(core, SupervisorState::Idle);
                }
            }
            Some(until) if now >= until => {
                core.cooldown_until = None;
                if core.state == SupervisorState::AntiCycleCooldown {
                    self.set_state(core, SupervisorState::Idle);
                }
            }
            Some(_) => {
                if !matches!(
                    core.state,
                    SupervisorState::Firing | SupervisorState::Failsafe
                ) {
                    self.set_state(core, SupervisorState::AntiCycleCooldown);
                }
            }
        }
    }

    fn schedule_retry(core: &mut Core, delay: TimeDelta, now: DateTime<Utc>) {
        if delay <= TimeDelta::zero() {
            return;
        }
        debug!(delay_secs = delay.num_seconds(), "scheduling boiler retry");
        core.retry.arm(now + delay);
    }

    fn failsafe_delay(core: &Core, now: DateTime<Utc>) -> TimeDelta {
        let exponent = core.retry_attempts.min(16);
        let backoff = TimeDelta::seconds((FAILSAFE_RETRY_SECS << exponent).min(RETRY_MAX_SECS));
        backoff.max(core.breaker.next_attempt_in(now))
    }

    async fn ensure_on(&self, core: &mut Core, now: DateTime<Utc>) {
        let remaining = Self::cooldown_remaining(core, now);
        let breaker_delay = core.breaker.next_attempt_in(now);
        let delay = remaining.max(breaker_delay);
        if delay > TimeDelta::zero() {
            debug!(
                cooldown_secs = remaining.num_seconds(),
                breaker_secs = breaker_delay.num_seconds(),
                "boiler on suppressed"
            );
            if breaker_delay > TimeDelta::zero() {
                self.set_state(core, SupervisorState::Failsafe);
            } else if core.state != SupervisorState::Failsafe {
                self.set_state(core, SupervisorState::AntiCycleCooldown);
            }
            Self::schedule_retry(core, delay, now);
            return;
        }
        if core.state == SupervisorState::AntiCycleCooldown {
            core.cooldown_until = None;
            self.set_state(core, SupervisorState::Idle);
        }

        if self.turn_on(core, now).await {
            info!(entity = self.driver.entity_id(), "boiler turn_on successful");
            core.retry.cancel();
            self.set_state(core, SupervisorState::Firing);
            return;
        }

        core.retry_attempts += 1;
        self.set_state(core, SupervisorState::Failsafe);
        let delay = Self::failsafe_delay(core, now);
        Self::schedule_retry(core, delay, now);
    }

    async fn ensure_off(&self, core: &mut Core, force: bool, now: DateTime<Utc>) {
        let Some(was_on) = self.turn_off(core, now).await else {
            core.retry_attempts += 1;
            self.set_state(core, SupervisorState::Failsafe);
            let delay = Self::failsafe_delay(core, now);
            Self::schedule_retry(core, delay, now);
            return;
        };

        info!(entity = self.driver.entity_id(), "boiler turn_off successful");
        core.retry.cancel();
        if was_on || force || core.state == SupervisorState::Firing {
            self.enter_cooldown(core, now);
            return;
        }
        if core.state == SupervisorState::Failsafe {
            if Self::cooldown_remaining(core, now) > TimeDelta::zero() {
                self.set_state(core, SupervisorState::AntiCycleCooldown);
            } else {
                core.cooldown_until = None;
                self.set_state(core, SupervisorState::Idle);
            }
            return;
        }
        self.update_cooldown(core, now);
    }

    async fn turn_on(&self, core: &mut Core, now: DateTime<Utc>) -> bool {
        if !core.breaker.can_attempt(now) {
            debug!("boiler circuit breaker open; skipping turn_on");
            return false;
        }
        let name = self.driver.describe_on();
        let result = core
            .executor
            .execute(&name, now, self.driver.turn_on(self.host.as_ref()))
            .await;
        match result {
            Ok(()) => {
                core.breaker.record_success();
                core.retry_attempts = 0;
                true
            }
            Err(e) => {
                warn!(entity = self.driver.entity_id(), error = %e, "boiler turn_on failed; scheduling retry");
                core.breaker.record_failure(now);
                false
            }
        }
    }

    /// `Some(was_on)` on success.
    async fn turn_off(&self, core: &mut Core, now: DateTime<Utc>) -> Option<bool> {
        if !core.breaker.can_attempt(now) {
            debug!("boiler circuit breaker open; skipping turn_off");
            return None;
        }
        let name = self.driver.describe_off();
        let result = core
            .executor
            .execute(&name, now, self.driver.turn_off(self.host.as_ref()))
            .await;
        match result {
            Ok(was_on) => {
                core.breaker.record_success();
                core.retry_attempts = 0;
                Some(was_on)
            }
            Err(e) => {
                warn!(entity = self.driver.entity_id(), error = %e, "boiler turn_off failed; scheduling retry");
                core.breaker.record_failure(now);
                None
            }
        }
    }
}
