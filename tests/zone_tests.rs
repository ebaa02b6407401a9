mod common;

use std::sync::Arc;

use chrono::{NaiveTime, TimeDelta, Weekday};
use common::{FakeHost, drain, living_room_config, living_room_plant, mins, secs, t0, trv};
use heatplant::detectors::WindowState;
use heatplant::zone::ScheduledTarget;
use heatplant::{
    Error, Event, HealthStatus, HvacAction, HvacMode, MemoryStore, Plant, PlantConfig, ScheduleRequest,
    SupervisorState, TargetMode, ZoneConfig, ZoneController, ZoneEvent, ZoneMode,
};

const TRV: &str = "climate.trv_living";
const TEMP: &str = "sensor.living_temp";
const WINDOW: &str = "binary_sensor.living_window";
const BATTERY: &str = "sensor.trv_living_battery";

type TestPlant = Plant<FakeHost, MemoryStore>;

async fn started(host: &Arc<FakeHost>) -> TestPlant {
    let mut plant = living_room_plant(host);
    plant.start(t0()).await;
    plant
}

fn living(plant: &TestPlant) -> &ZoneController<FakeHost, MemoryStore> {
    plant.zone("living").unwrap()
}

fn last_trv_mode(host: &FakeHost) -> Option<String> {
    host.calls_to("climate.set_hvac_mode")
        .last()
        .and_then(|c| c.data["hvac_mode"].as_str().map(str::to_string))
}

fn zone_events(events: &[Event]) -> Vec<ZoneEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Zone { event, .. } => Some(event.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn startup_applies_compensated_schedule_and_requests_heat() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    let zone = living(&plant);
    assert_eq!(zone.target_mode(), TargetMode::Scheduled);
    assert_eq!(zone.target_temperature(), 20.0);
    assert!(zone.demand());
    assert_eq!(zone.hvac_action(t0()), HvacAction::Heating);
    // 20 + (20 - 18) * 2
    assert_eq!(host.last_trv_temperature(TRV), Some(24.0));
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));

    // The startup force-off holds the boiler in cooldown first.
    assert_eq!(plant.supervisor().state().await, SupervisorState::AntiCycleCooldown);
    plant.tick(t0() + mins(5)).await;
    assert_eq!(plant.supervisor().state().await, SupervisorState::Firing);
    assert!(host.entity("switch.boiler").unwrap().is_on());
}

#[tokio::test]
async fn manual_requests_boost_save_and_clear() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    plant.set_temperature("living", 23.0, t0() + mins(1)).await.unwrap();
    assert_eq!(living(&plant).target_mode(), TargetMode::Boost(23.0));
    assert_eq!(host.last_trv_temperature(TRV), Some(30.0));

    plant.set_temperature("living", 17.0, t0() + mins(2)).await.unwrap();
    let zone = living(&plant);
    assert_eq!(zone.target_mode(), TargetMode::Save(17.0));
    assert!(!zone.demand());
    assert_eq!(host.last_trv_temperature(TRV), Some(15.0));

    plant.set_temperature("living", 20.0, t0() + mins(3)).await.unwrap();
    assert_eq!(living(&plant).target_mode(), TargetMode::Scheduled);

    let err = plant.set_temperature("attic", 20.0, t0()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownZone(id) if id == "attic"));
}

#[tokio::test]
async fn boost_expires_after_ninety_minutes() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    plant.set_temperature("living", 23.0, t0()).await.unwrap();

    plant.tick(t0() + mins(89)).await;
    assert_eq!(living(&plant).target_mode(), TargetMode::Boost(23.0));

    plant.tick(t0() + mins(90)).await;
    assert_eq!(living(&plant).target_mode(), TargetMode::Scheduled);
    assert_eq!(host.last_trv_temperature(TRV), Some(24.0));
}

#[tokio::test]
async fn immediate_schedule_clears_save_but_keeps_boost() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    plant.set_temperature("living", 17.0, t0()).await.unwrap();
    assert!(plant
        .handle_schedule(ScheduleRequest::for_area("living", 19.0), t0() + mins(1))
        .await);
    let zone = living(&plant);
    assert_eq!(zone.target_mode(), TargetMode::Scheduled);
    assert_eq!(zone.runtime().schedule_target, Some(19.0));
    assert_eq!(zone.target_temperature(), 19.0);

    plant.set_temperature("living", 23.0, t0() + mins(2)).await.unwrap();
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0), t0() + mins(3))
        .await;
    assert_eq!(living(&plant).target_mode(), TargetMode::Boost(23.0));
    assert_eq!(living(&plant).runtime().schedule_target, Some(21.0));
}

#[tokio::test]
async fn future_schedule_preheats_then_persists_target() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    let mut rx = plant.subscribe();

    let effective = t0() + TimeDelta::hours(3);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0).effective_at(effective), t0())
        .await;
    assert_eq!(
        living(&plant).runtime().pending,
        Some(ScheduledTarget { target: 21.0, effective_at: effective })
    );
    assert_eq!(living(&plant).target_temperature(), 20.0);

    // 3 °C at the default 1.5 °C/h: preheat starts two hours early.
    plant.tick(t0() + mins(59)).await;
    assert!(living(&plant).runtime().preheat.is_none());

    plant.tick(t0() + mins(60)).await;
    assert_eq!(living(&plant).target_mode(), TargetMode::Preheat(21.0));
    assert!(zone_events(&drain(&mut rx)).contains(&ZoneEvent::PreheatStarted { target: 21.0 }));

    plant.tick(effective).await;
    let zone = living(&plant);
    assert_eq!(zone.target_mode(), TargetMode::Scheduled);
    assert_eq!(zone.runtime().schedule_target, Some(21.0));
    assert!(zone.runtime().pending.is_none());
    assert_eq!(host.calls_to("number.set_value").len(), 1);
    assert_eq!(
        host.entity("number.living_room_schedule_target").unwrap().as_f64(),
        Some(21.0)
    );
}

#[tokio::test]
async fn preheat_starts_at_once_when_already_late() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    let mut rx = plant.subscribe();

    // 3 °C needs two hours at 1.5 °C/h but only one is left.
    let effective = t0() + TimeDelta::hours(1);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0).effective_at(effective), t0())
        .await;
    let zone = living(&plant);
    assert_eq!(zone.target_mode(), TargetMode::Preheat(21.0));
    assert_eq!(zone.runtime().preheat.map(|p| p.target), Some(21.0));
    assert!(zone.runtime().pending.is_some());
    // 21 + (21 - 18) * 2
    assert_eq!(host.last_trv_temperature(TRV), Some(27.0));
    assert!(zone_events(&drain(&mut rx)).contains(&ZoneEvent::PreheatStarted { target: 21.0 }));
}

#[tokio::test]
async fn preheat_yields_to_manual_overrides() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    plant.set_temperature("living", 17.0, t0()).await.unwrap();
    let effective = t0() + TimeDelta::hours(3);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0).effective_at(effective), t0() + mins(1))
        .await;
    plant.tick(t0() + mins(60)).await;
    let zone = living(&plant);
    assert!(zone.runtime().preheat.is_none());
    assert_eq!(zone.target_mode(), TargetMode::Save(17.0));

    // Already late: still nothing while a Boost is active.
    plant.set_temperature("living", 23.0, t0() + mins(61)).await.unwrap();
    plant
        .handle_schedule(
            ScheduleRequest::for_area("living", 22.0).effective_at(t0() + mins(90)),
            t0() + mins(62),
        )
        .await;
    let zone = living(&plant);
    assert!(zone.runtime().preheat.is_none());
    assert_eq!(zone.target_mode(), TargetMode::Boost(23.0));
}

#[tokio::test]
async fn no_preheat_when_room_is_already_warm_enough() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    let effective = t0() + TimeDelta::hours(1);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 17.5).effective_at(effective), t0())
        .await;
    let zone = living(&plant);
    assert!(zone.runtime().preheat.is_none());
    assert!(zone.runtime().pending.is_some());
    assert_eq!(zone.target_mode(), TargetMode::Scheduled);

    // Queued while cold, but the room warms past the target before the start.
    let effective = t0() + TimeDelta::hours(3);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0).effective_at(effective), t0() + mins(1))
        .await;
    host.set(TEMP, "21.5");
    plant.handle_state_change(TEMP, t0() + mins(30)).await;
    plant.tick(t0() + mins(60)).await;
    assert!(living(&plant).runtime().preheat.is_none());
    assert_eq!(living(&plant).target_mode(), TargetMode::Scheduled);
}

#[tokio::test]
async fn demand_needs_more_than_a_tenth_of_a_degree() {
    let host = FakeHost::new();
    let mut plant = living_room_plant(&host);
    host.set(TEMP, "19.9");
    plant.start(t0()).await;
    assert_eq!(living(&plant).target_temperature(), 20.0);
    assert!(!living(&plant).demand());

    host.set(TEMP, "19.85");
    plant.handle_state_change(TEMP, t0() + mins(1)).await;
    plant.tick(t0() + mins(1) + secs(5)).await;
    assert!(living(&plant).demand());

    host.set(TEMP, "19.95");
    plant.handle_state_change(TEMP, t0() + mins(2)).await;
    plant.tick(t0() + mins(2) + secs(5)).await;
    assert!(!living(&plant).demand());
}

#[tokio::test]
async fn empty_house_runs_eco_without_preheat() {
    let host = FakeHost::new();
    let mut plant = living_room_plant(&host);
    host.set("zone.home", "0");
    plant.start(t0()).await;

    assert_eq!(living(&plant).target_mode(), TargetMode::Eco);
    assert_eq!(living(&plant).target_temperature(), 16.0);

    host.set("number.heatplant_eco_temp", "14.5");
    assert_eq!(living(&plant).target_temperature(), 14.5);

    let effective = t0() + TimeDelta::hours(3);
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 21.0).effective_at(effective), t0())
        .await;
    plant.tick(effective - mins(1)).await;
    assert!(living(&plant).runtime().preheat.is_none());
    assert!(living(&plant).runtime().pending.is_some());
}

#[tokio::test]
async fn open_window_sensor_turns_trvs_off() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    host.set(WINDOW, "on");
    plant.handle_state_change(WINDOW, t0() + mins(1)).await;
    let zone = living(&plant);
    assert_eq!(zone.window().state(), WindowState::SensorOpen);
    assert_eq!(zone.hvac_mode(t0() + mins(1)), HvacMode::Off);
    // Output is debounced.
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));

    plant.tick(t0() + mins(1) + secs(5)).await;
    assert_eq!(last_trv_mode(&host).as_deref(), Some("off"));
    assert_eq!(host.last_trv_temperature(TRV), Some(5.0));
    assert!(!living(&plant).demand());

    host.set(WINDOW, "off");
    plant.handle_state_change(WINDOW, t0() + mins(2)).await;
    plant.tick(t0() + mins(2) + secs(5)).await;
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));
    assert_eq!(host.last_trv_temperature(TRV), Some(24.0));
    assert!(living(&plant).demand());
}

#[tokio::test]
async fn rapid_temperature_drop_starts_a_window_hold() {
    let host = FakeHost::new();
    let mut config = living_room_config(&host);
    config.zones[0].window_sensors.clear();
    let mut plant = Plant::new(config, host.clone(), MemoryStore::new()).unwrap();
    plant.start(t0()).await;
    let mut rx = plant.subscribe();

    host.set(TEMP, "17.0");
    plant.handle_state_change(TEMP, t0() + mins(2)).await;
    let zone = living(&plant);
    assert_eq!(zone.window().state(), WindowState::Hold);
    assert_eq!(zone.window().hold_until(), Some(t0() + mins(17)));
    assert!(zone.is_forced_off(t0() + mins(2)));

    plant.tick(t0() + mins(2) + secs(5)).await;
    assert_eq!(last_trv_mode(&host).as_deref(), Some("off"));

    plant.tick(t0() + mins(17)).await;
    assert_eq!(living(&plant).window().state(), WindowState::Monitoring);
    plant.tick(t0() + mins(17) + secs(5)).await;
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));
    // 20 + (20 - 17) * 2
    assert_eq!(host.last_trv_temperature(TRV), Some(26.0));

    let events = zone_events(&drain(&mut rx));
    assert!(events.contains(&ZoneEvent::WindowHoldStarted));
    assert!(events.contains(&ZoneEvent::WindowHoldCleared));
}

#[tokio::test]
async fn low_battery_locks_zone_at_failsafe_temperature() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    host.set(BATTERY, "3");
    plant.handle_state_change(BATTERY, t0() + mins(1)).await;
    let zone = living(&plant);
    assert_eq!(zone.mode(), ZoneMode::BatteryCritical);
    assert_eq!(zone.target_mode(), TargetMode::Failsafe(15.0));
    assert_eq!(zone.target_temperature(), 15.0);

    plant.tick(t0() + mins(1) + secs(5)).await;
    assert_eq!(host.last_trv_temperature(TRV), Some(15.0));
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));

    // User and schedule paths are ignored while locked.
    plant.set_temperature("living", 25.0, t0() + mins(2)).await.unwrap();
    plant.set_hvac_mode("living", HvacMode::Off, t0() + mins(2)).await.unwrap();
    plant
        .handle_schedule(ScheduleRequest::for_area("living", 22.0), t0() + mins(2))
        .await;
    let zone = living(&plant);
    assert_eq!(zone.runtime().override_mode, None);
    assert_eq!(zone.runtime().schedule_target, Some(20.0));
    assert!(!zone.is_forced_off(t0() + mins(2)));

    host.set(BATTERY, "80");
    plant.handle_state_change(BATTERY, t0() + mins(3)).await;
    plant.tick(t0() + mins(3) + secs(5)).await;
    assert_eq!(living(&plant).mode(), ZoneMode::Operational);
    assert_eq!(host.last_trv_temperature(TRV), Some(24.0));
}

#[tokio::test]
async fn hvac_off_forces_trvs_off() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;

    plant.set_hvac_mode("living", HvacMode::Off, t0() + mins(1)).await.unwrap();
    let zone = living(&plant);
    assert_eq!(zone.hvac_mode(t0() + mins(1)), HvacMode::Off);
    assert_eq!(zone.hvac_action(t0() + mins(1)), HvacAction::Off);
    assert!(!zone.demand());
    assert_eq!(last_trv_mode(&host).as_deref(), Some("off"));

    plant.set_hvac_mode("living", HvacMode::Heat, t0() + mins(2)).await.unwrap();
    assert_eq!(last_trv_mode(&host).as_deref(), Some("heat"));
    assert!(living(&plant).demand());
}

#[tokio::test]
async fn unreachable_trvs_are_retried() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    host.clear_calls();

    host.set(TRV, "unavailable");
    plant.set_temperature("living", 23.0, t0() + mins(1)).await.unwrap();
    assert!(host.calls_to("climate.set_temperature").is_empty());
    // Demand is still reported without actuators.
    assert!(living(&plant).demand());
    assert_eq!(living(&plant).next_wakeup(), Some(t0() + mins(1) + secs(30)));

    host.set_entity(TRV, trv("heat", 18.0));
    plant.tick(t0() + mins(1) + secs(30)).await;
    assert_eq!(host.last_trv_temperature(TRV), Some(30.0));
}

#[tokio::test]
async fn trv_only_zone_sends_uncompensated_target() {
    let host = FakeHost::new();
    host.set("switch.boiler", "off");
    host.set("zone.home", "1");
    host.set_entity("climate.trv_office", trv("heat", 18.0));
    host.set("number.office_schedule_target", "20");
    let mut zone = ZoneConfig::new("office", "Office");
    zone.trvs = vec!["climate.trv_office".into()];
    let mut config = PlantConfig::new("switch.boiler").with_zone(zone);
    config.valve_maintenance = false;

    let mut plant = Plant::new(config, host.clone(), MemoryStore::new()).unwrap();
    plant.start(t0()).await;

    let office = plant.zone("office").unwrap();
    assert_eq!(office.runtime().current_temperature, Some(18.0));
    assert!(office.demand());
    assert_eq!(host.last_trv_temperature("climate.trv_office"), Some(20.0));
}

#[tokio::test]
async fn stalled_heating_is_reported() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    let mut rx = plant.subscribe();

    plant.tick(t0() + TimeDelta::hours(2)).await;
    assert_eq!(living(&plant).health(), HealthStatus::PossibleActuatorFailure);
    assert!(zone_events(&drain(&mut rx)).contains(&ZoneEvent::Failure {
        status: HealthStatus::PossibleActuatorFailure
    }));
}

#[tokio::test]
async fn rising_idle_temperature_means_valve_stuck_open() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    plant.set_temperature("living", 17.0, t0()).await.unwrap();
    assert!(!living(&plant).demand());

    host.set(TEMP, "19.5");
    plant.handle_state_change(TEMP, t0() + mins(30)).await;
    plant.tick(t0() + mins(30) + secs(5)).await;
    assert_eq!(living(&plant).health(), HealthStatus::Ok);

    plant.tick(t0() + mins(61)).await;
    assert_eq!(living(&plant).health(), HealthStatus::ValveStuckOpen);
}

#[tokio::test]
async fn valve_exercise_cycles_then_restores_output() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    plant.set_temperature("living", 17.0, t0()).await.unwrap();

    plant.exercise_valves("living", t0() + mins(1)).await.unwrap();
    assert_eq!(living(&plant).mode(), ZoneMode::Maintenance);
    assert_eq!(host.last_trv_temperature(TRV), Some(30.0));

    plant.tick(t0() + mins(3)).await;
    assert_eq!(host.last_trv_temperature(TRV), Some(5.0));

    plant.tick(t0() + mins(5)).await;
    assert_eq!(living(&plant).mode(), ZoneMode::Operational);
    // 17 + (17 - 18) * 2
    assert_eq!(host.last_trv_temperature(TRV), Some(15.0));
}

#[tokio::test]
async fn valve_exercise_is_skipped_while_heating() {
    let host = FakeHost::new();
    let mut plant = started(&host).await;
    host.clear_calls();

    plant.exercise_valves("living", t0() + mins(1)).await.unwrap();
    assert_eq!(living(&plant).mode(), ZoneMode::Operational);
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn weekly_maintenance_slot_starts_the_exercise() {
    let host = FakeHost::new();
    let mut config = living_room_config(&host);
    config.valve_maintenance = true;
    config.maintenance_day = Weekday::Mon;
    config.maintenance_time = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
    let mut plant = Plant::new(config, host.clone(), MemoryStore::new()).unwrap();
    plant.start(t0()).await;
    plant.set_temperature("living", 17.0, t0()).await.unwrap();

    plant.tick(t0() + TimeDelta::hours(3)).await;
    assert_eq!(living(&plant).mode(), ZoneMode::Maintenance);
    assert_eq!(host.last_trv_temperature(TRV), Some(30.0));
}
