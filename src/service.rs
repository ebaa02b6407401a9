use std::fmt;
use std::future::Future;

use serde_json::{Value, json};

use crate::Result;
use crate::states::StateSource;
use crate::types::HvacMode;

pub const DOMAIN_CLIMATE: &str = "climate";
pub const DOMAIN_NUMBER: &str = "number";
pub const SERVICE_SET_HVAC_MODE: &str = "set_hvac_mode";
pub const SERVICE_SET_TEMPERATURE: &str = "set_temperature";
pub const SERVICE_SET_VALUE: &str = "set_value";
pub const SERVICE_TURN_ON: &str = "turn_on";
pub const SERVICE_TURN_OFF: &str = "turn_off";

/// One host service invocation (`<domain>.<service>` plus its JSON payload).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Value,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>, data: Value) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            data,
        }
    }

    pub fn set_hvac_mode(entities: &[String], mode: HvacMode) -> Self {
        Self::new(
            DOMAIN_CLIMATE,
            SERVICE_SET_HVAC_MODE,
            json!({
                "entity_id": entities,
                "hvac_mode": mode.as_service_str()
            }),
        )
    }

    pub fn set_temperature(entities: &[String], temperature: f64) -> Self {
        Self::new(
            DOMAIN_CLIMATE,
            SERVICE_SET_TEMPERATURE,
            json!({
                "entity_id": entities,
                "temperature": temperature
            }),
        )
    }

    pub fn turn_on(domain: &str, entity_id: &str) -> Self {
        Self::new(domain, SERVICE_TURN_ON, json!({ "entity_id": entity_id }))
    }

    pub fn turn_off(domain: &str, entity_id: &str) -> Self {
        Self::new(domain, SERVICE_TURN_OFF, json!({ "entity_id": entity_id }))
    }

    pub fn set_number(entity_id: &str, value: f64) -> Self {
        Self::new(
            DOMAIN_NUMBER,
            SERVICE_SET_VALUE,
            json!({
                "entity_id": entity_id,
                "value": value
            }),
        )
    }

    /// Entity ids targeted by the call, whether given as a string or a list.
    pub fn entity_ids(&self) -> Vec<String> {
        match self.data.get("entity_id") {
            Some(Value::String(id)) => vec![id.clone()],
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => vec![],
        }
    }
}

impl fmt::Display for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.service)
    }
}

/// Actuator side of the host: service registry lookups and calls.
///
/// Calls may fail with [`crate::Error::EntityUnavailable`] or
/// [`crate::Error::ServiceUnavailable`]; callers treat both as retryable.
pub trait ServiceBus: StateSource {
    fn has_service(&self, domain: &str, service: &str) -> bool;

    fn call(&self, call: ServiceCall) -> impl Future<Output = Result<()>> + Send;
}
