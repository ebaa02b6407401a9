use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::service::{ServiceBus, ServiceCall};
use crate::states::{EntityState, StateSnapshot, StateSource};
use crate::{Error, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct StateEntry {
    entity_id: String,
    state: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ServiceDomain {
    domain: String,
    #[serde(default)]
    services: Map<String, Value>,
}

pub struct RestHostBuilder {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl RestHostBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RestHost> {
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        Ok(RestHost {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            token: self.token,
            states: StateSnapshot::new(),
            services: RwLock::new(HashMap::new()),
        })
    }
}

/// Host reached over its REST API.
///
/// Entity states are cached locally and only change on [`RestHost::refresh`];
/// reads never touch the network. Service calls go straight to the host.
pub struct RestHost {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    states: StateSnapshot,
    services: RwLock<HashMap<String, HashSet<String>>>,
}

impl RestHost {
    pub fn builder(base_url: impl Into<String>) -> RestHostBuilder {
        RestHostBuilder::new(base_url)
    }

    pub fn states(&self) -> &StateSnapshot {
        &self.states
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Re-read every entity state. Returns the ids that changed, appeared or
    /// disappeared since the last refresh.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        debug!(url = %self.base_url, "refreshing entity states");
        let entries: Vec<StateEntry> = self
            .request(reqwest::Method::GET, "/api/states")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let next: HashMap<String, EntityState> = entries
            .into_iter()
            .map(|e| {
                (
                    e.entity_id,
                    EntityState {
                        state: e.state,
                        attributes: e.attributes,
                    },
                )
            })
            .collect();
        let changed = self.states.replace_all(next);
        trace!(changed = changed.len(), total = self.states.len(), "states refreshed");
        Ok(changed)
    }

    /// Re-read the host's service registry.
    pub async fn refresh_services(&self) -> Result<usize> {
        let domains: Vec<ServiceDomain> = self
            .request(reqwest::Method::GET, "/api/services")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let registry: HashMap<String, HashSet<String>> = domains
            .into_iter()
            .map(|d| (d.domain, d.services.into_iter().map(|(name, _)| name).collect()))
            .collect();
        let count = registry.values().map(HashSet::len).sum();
        debug!(domains = registry.len(), services = count, "service registry loaded");
        *self.services.write() = registry;
        Ok(count)
    }
}

impl StateSource for RestHost {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.state(entity_id)
    }
}

impl ServiceBus for RestHost {
    /// Before the registry has been loaded every service is assumed present.
    fn has_service(&self, domain: &str, service: &str) -> bool {
        let registry = self.services.read();
        if registry.is_empty() {
            return true;
        }
        registry
            .get(domain)
            .is_some_and(|services| services.contains(service))
    }

    async fn call(&self, call: ServiceCall) -> Result<()> {
        let path = format!("/api/services/{}/{}", call.domain, call.service);
        debug!(service = %call, entities = ?call.entity_ids(), "calling host service");
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&call.data)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::ServiceUnavailable(call.to_string()));
        }
        resp.error_for_status()?;
        Ok(())
    }
}
