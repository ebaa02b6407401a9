use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";
pub const STATE_HOME: &str = "home";
pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";

/// Snapshot of one host entity: its textual state plus attributes.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// `unavailable`/`unknown` carry no data.
    pub fn is_available(&self) -> bool {
        self.state != STATE_UNAVAILABLE && self.state != STATE_UNKNOWN
    }

    pub fn is_on(&self) -> bool {
        self.state == STATE_ON
    }

    pub fn as_f64(&self) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        self.state.trim().parse::<f64>().ok()
    }

    /// Numeric attribute; accepts numbers and numeric strings.
    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

/// Read-only accessor for live entity states.
pub trait StateSource: Send + Sync {
    fn state(&self, entity_id: &str) -> Option<EntityState>;

    /// Numeric state, treating missing/unavailable/unknown as absent.
    fn state_f64(&self, entity_id: &str) -> Option<f64> {
        self.state(entity_id).and_then(|s| s.as_f64())
    }
}

/// Thread-safe in-memory state table. Used as the REST host's cache and by
/// embedders that push states in themselves.
#[derive(Debug, Default)]
pub struct StateSnapshot {
    states: RwLock<HashMap<String, EntityState>>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: impl Into<String>, state: EntityState) {
        self.states.write().insert(entity_id.into(), state);
    }

    pub fn remove(&self, entity_id: &str) -> Option<EntityState> {
        self.states.write().remove(entity_id)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Replace the whole table and return the ids whose state or attributes
    /// changed, appeared or disappeared.
    pub fn replace_all(&self, next: HashMap<String, EntityState>) -> Vec<String> {
        let mut guard = self.states.write();
        let mut changed: Vec<String> = next
            .iter()
            .filter(|(id, state)| guard.get(*id) != Some(*state))
            .map(|(id, _)| id.clone())
            .collect();
        changed.extend(guard.keys().filter(|id| !next.contains_key(*id)).cloned());
        *guard = next;
        changed.sort();
        changed
    }

    /// Apply a mutation to an existing entity (used by in-process drivers).
    pub fn update<F>(&self, entity_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut EntityState),
    {
        match self.states.write().get_mut(entity_id) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }
}

impl StateSource for StateSnapshot {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.read().get(entity_id).cloned()
    }
}
