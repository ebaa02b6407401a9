use std::collections::VecDeque;
use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::service::{
    DOMAIN_CLIMATE, SERVICE_SET_HVAC_MODE, SERVICE_SET_TEMPERATURE, ServiceBus, ServiceCall,
};
use crate::types::HvacMode;
use crate::{Error, Result};

const DEFAULT_HISTORY_SIZE: usize = 50;
const BOOST_TOLERANCE_C: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Queued,
    Executed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: Uuid,
    pub when: DateTime<Utc>,
    pub name: String,
    pub status: CommandStatus,
    pub detail: Option<String>,
}

/// Runs actuator commands and keeps a bounded history of what happened.
#[derive(Debug)]
pub struct CommandExecutor {
    history: VecDeque<CommandRecord>,
    history_size: usize,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl CommandExecutor {
    pub fn new(history_size: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_size),
            history_size: history_size.max(1),
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &CommandRecord> {
        self.history.iter()
    }

    pub fn last(&self) -> Option<&CommandRecord> {
        self.history.back()
    }

    pub async fn execute<T, F>(&mut self, name: &str, now: DateTime<Utc>, command: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let id = Uuid::new_v4();
        self.record(id, now, name, CommandStatus::Queued, None);
        match command.await {
            Ok(value) => {
                trace!(command = name, %id, "command executed");
                self.record(id, now, name, CommandStatus::Executed, None);
                Ok(value)
            }
            Err(e) => {
                debug!(command = name, %id, error = %e, "command failed");
                self.record(id, now, name, CommandStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn record(
        &mut self,
        id: Uuid,
        when: DateTime<Utc>,
        name: &str,
        status: CommandStatus,
        detail: Option<String>,
    ) {
        self.history.push_back(CommandRecord {
            id,
            when,
            name: name.to_string(),
            status,
            detail,
        });
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }
}

/// How the shared heat source is switched.
#[derive(Debug, Clone, PartialEq)]
pub enum BoilerDriver {
    /// A `climate.*` entity driven between boost and off temperatures.
    Climate {
        entity_id: String,
        boost_temp: f64,
        off_temp: f64,
    },
    /// Any on/off entity (`switch.*`, `input_boolean.*`, ...).
    Switch { entity_id: String, domain: String },
}

impl BoilerDriver {
    pub fn new(entity_id: &str, boost_temp: f64, off_temp: f64) -> Self {
        let domain = entity_id.split('.').next().unwrap_or_default();
        if domain == DOMAIN_CLIMATE {
            BoilerDriver::Climate {
                entity_id: entity_id.to_string(),
                boost_temp,
                off_temp,
            }
        } else {
            BoilerDriver::Switch {
                entity_id: entity_id.to_string(),
                domain: domain.to_string(),
            }
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            BoilerDriver::Climate { entity_id, .. } | BoilerDriver::Switch { entity_id, .. } => {
                entity_id
            }
        }
    }

    pub fn describe_on(&self) -> String {
        match self {
            BoilerDriver::Climate {
                entity_id,
                boost_temp,
                ..
            } => format!("boiler_on({entity_id} -> {boost_temp})"),
            BoilerDriver::Switch { entity_id, .. } => format!("boiler_on({entity_id})"),
        }
    }

    pub fn describe_off(&self) -> String {
        match self {
            BoilerDriver::Climate {
                entity_id, off_temp, ..
            } => format!("boiler_off({entity_id} -> {off_temp})"),
            BoilerDriver::Switch { entity_id, .. } => format!("boiler_off({entity_id})"),
        }
    }

    pub async fn turn_on<H: ServiceBus>(&self, host: &H) -> Result<()> {
        let entity_id = self.entity_id();
        let state = host
            .state(entity_id)
            .filter(|s| s.is_available())
            .ok_or_else(|| Error::EntityUnavailable(entity_id.to_string()))?;

        match self {
            BoilerDriver::Climate { boost_temp, .. } => {
                let already_boosting = state.state == HvacMode::Heat.as_service_str()
                    && state
                        .attribute_f64("temperature")
                        .is_some_and(|t| (t - boost_temp).abs() < BOOST_TOLERANCE_C);
                if already_boosting {
                    return Ok(());
                }
                if !host.has_service(DOMAIN_CLIMATE, SERVICE_SET_TEMPERATURE) {
                    return Err(Error::ServiceUnavailable(format!(
                        "{DOMAIN_CLIMATE}.{SERVICE_SET_TEMPERATURE}"
                    )));
                }
                let entities = [entity_id.to_string()];
                if host.has_service(DOMAIN_CLIMATE, SERVICE_SET_HVAC_MODE) {
                    host.call(ServiceCall::set_hvac_mode(&entities, HvacMode::Heat))
                        .await?;
                }
                host.call(ServiceCall::set_temperature(&entities, *boost_temp))
                    .await
            }
            BoilerDriver::Switch { domain, .. } => {
                if state.is_on() {
                    return Ok(());
                }
                host.call(ServiceCall::turn_on(domain, entity_id)).await
            }
        }
    }

    /// Returns whether the boiler was on before the call.
    pub async fn turn_off<H: ServiceBus>(&self, host: &H) -> Result<bool> {
        let entity_id = self.entity_id();
        let state = host
            .state(entity_id)
            .filter(|s| s.is_available())
            .ok_or_else(|| Error::EntityUnavailable(entity_id.to_string()))?;

        match self {
            BoilerDriver::Climate { off_temp, .. } => {
                let was_on = state.state == HvacMode::Heat.as_service_str();
                if !host.has_service(DOMAIN_CLIMATE, SERVICE_SET_TEMPERATURE) {
                    return Err(Error::ServiceUnavailable(format!(
                        "{DOMAIN_CLIMATE}.{SERVICE_SET_TEMPERATURE}"
                    )));
                }
                let supports_off = state
                    .attributes
                    .get("hvac_modes")
                    .and_then(|v| v.as_array())
                    .is_some_and(|modes| {
                        modes
                            .iter()
                            .any(|m| m.as_str() == Some(HvacMode::Off.as_service_str()))
                    });
                let entities = [entity_id.to_string()];
                if supports_off && host.has_service(DOMAIN_CLIMATE, SERVICE_SET_HVAC_MODE) {
                    host.call(ServiceCall::set_hvac_mode(&entities, HvacMode::Off))
                        .await?;
                }
                host.call(ServiceCall::set_temperature(&entities, *off_temp))
                    .await?;
                Ok(was_on)
            }
            BoilerDriver::Switch { domain, .. } => {
                let was_on = state.is_on();
                host.call(ServiceCall::turn_off(domain, entity_id)).await?;
                Ok(was_on)
            }
        }
    }
}

/// Mode + temperature command for a group of TRVs.
#[derive(Debug, Clone, PartialEq)]
pub struct TrvCommand {
    pub entities: Vec<String>,
    pub mode: HvacMode,
    pub temperature: f64,
}

impl TrvCommand {
    pub fn new(entities: Vec<String>, mode: HvacMode, temperature: f64) -> Self {
        Self {
            entities,
            mode,
            temperature,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "trv_{}({} -> {})",
            self.mode.as_service_str(),
            self.entities.len(),
            self.temperature
        )
    }

    pub async fn send<H: ServiceBus>(&self, host: &H) -> Result<()> {
        if self.entities.is_empty() {
            return Ok(());
        }
        host.call(ServiceCall::set_hvac_mode(&self.entities, self.mode))
            .await?;
        host.call(ServiceCall::set_temperature(&self.entities, self.temperature))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    #[test]
    fn driver_kind_follows_entity_domain() {
        let climate = BoilerDriver::new("climate.boiler", 25.0, 5.0);
        assert!(matches!(climate, BoilerDriver::Climate { .. }));
        let switch = BoilerDriver::new("switch.boiler_relay", 25.0, 5.0);
        assert_eq!(
            switch,
            BoilerDriver::Switch {
                entity_id: "switch.boiler_relay".to_string(),
                domain: "switch".to_string()
            }
        );
        assert_eq!(switch.describe_on(), "boiler_on(switch.boiler_relay)");
    }

    #[tokio::test]
    async fn executor_records_outcomes() {
        let mut executor = CommandExecutor::new(3);
        let ok: Result<u8> = executor.execute("first", now(), async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let failed: Result<()> = executor
            .execute("second", now(), async {
                Err(Error::EntityUnavailable("switch.boiler".into()))
            })
            .await;
        assert!(failed.is_err());

        // queued + outcome per command, capped at 3
        let history: Vec<_> = executor.history().collect();
        assert_eq!(history.len(), 3);
        let last = executor.last().unwrap();
        assert_eq!(last.name, "second");
        assert_eq!(last.status, CommandStatus::Failed);
        assert_eq!(last.detail.as_deref(), Some("entity unavailable: switch.boiler"));
    }
}
