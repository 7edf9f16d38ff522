use std::sync::{Arc, PoisonError, RwLock};

use crate::config::ConfigSource;
use crate::endpoint::Endpoint;
use crate::error::ConfigError;

/// Immutable view of the endpoints loaded by one reload, in configuration
/// order.
#[derive(Debug, Clone, Default)]
pub struct EndpointSnapshot {
    endpoints: Vec<Endpoint>,
}

impl EndpointSnapshot {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Endpoint owning a ledger entry, looked up by name-node address.
    pub fn by_address(&self, name_node: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name_node == name_node)
    }

    pub fn names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Loads endpoint definitions from a [`ConfigSource`] and publishes them as
/// snapshots.
///
/// A reload builds a complete new snapshot before swapping it in, so
/// readers only ever see the previous snapshot or the finished new one.
pub struct EndpointRegistry {
    source: Arc<dyn ConfigSource>,
    section: String,
    current: RwLock<Arc<EndpointSnapshot>>,
}

impl EndpointRegistry {
    pub fn new(source: Arc<dyn ConfigSource>, section: impl Into<String>) -> Self {
        Self {
            source,
            section: section.into(),
            current: RwLock::new(Arc::new(EndpointSnapshot::default())),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<EndpointSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload the requested `(pool, endpoint)` pairs.
    ///
    /// Endpoints whose section is missing or incomplete are logged and
    /// skipped. The reload only fails when the configuration source itself
    /// cannot be read, in which case the previous snapshot stays in place.
    pub fn reload(
        &self,
        requested: &[(String, String)],
    ) -> Result<Arc<EndpointSnapshot>, ConfigError> {
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(requested.len());

        for (pool, name) in requested {
            if endpoints.iter().any(|e| &e.name == name) {
                continue;
            }
            let path = format!("{}/{}", self.section, name);
            let options = match self.source.options(&path) {
                Ok(options) => options,
                Err(ConfigError::Invalid(reason)) => {
                    tracing::error!(endpoint = %name, reason = %reason, "Endpoint section unavailable, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match Endpoint::from_options(name, pool, &options) {
                Ok(endpoint) => {
                    tracing::debug!(
                        endpoint = %endpoint.name,
                        name_node = %endpoint.name_node,
                        software = %endpoint.software,
                        version = %endpoint.software_version,
                        language = %endpoint.language.name,
                        capacity = endpoint.capacity,
                        "Endpoint configured"
                    );
                    endpoints.push(endpoint);
                }
                Err(e) => {
                    tracing::error!(endpoint = %name, error = %e, "Invalid endpoint definition, skipping");
                }
            }
        }

        let snapshot = Arc::new(EndpointSnapshot::new(endpoints));
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        tracing::info!(endpoints = ?snapshot.names(), "Endpoint configuration reloaded");
        Ok(snapshot)
    }
}
