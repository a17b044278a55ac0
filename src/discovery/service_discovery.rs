//! Service Discovery
//!
//! Resolves a logical backend id to the base URLs of its reachable instances.
//! The gateway only reads from discovery; how instances get registered is the
//! registry's business. [`StaticDiscovery`] serves a table loaded from config
//! that can be updated at runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use url::Url;

use crate::core::error::GatewayResult;

/// Read-only view of a service registry
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Reachable base URLs for `backend_id`; empty when none are known
    async fn resolve(&self, backend_id: &str) -> GatewayResult<Vec<Url>>;

    /// Every known service with its instances
    async fn services(&self) -> GatewayResult<Vec<ServiceEntry>>;
}

/// One service and its instance addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEntry {
    pub backend_id: String,
    pub instances: Vec<Url>,
}

/// In-memory service table for static deployments and tests
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: DashMap<String, Vec<Url>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &HashMap<String, Vec<Url>>) -> Self {
        let discovery = Self::new();
        for (backend_id, instances) in table {
            discovery.register(backend_id.clone(), instances.clone());
        }
        discovery
    }

    /// Replace the instance list for `backend_id`
    pub fn register(&self, backend_id: impl Into<String>, instances: Vec<Url>) {
        let backend_id = backend_id.into();
        info!(backend = %backend_id, instances = instances.len(), "Registered service");
        self.services.insert(backend_id, instances);
    }

    pub fn deregister(&self, backend_id: &str) -> bool {
        let removed = self.services.remove(backend_id).is_some();
        if removed {
            info!(backend = %backend_id, "Deregistered service");
        }
        removed
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, backend_id: &str) -> GatewayResult<Vec<Url>> {
        let instances = self
            .services
            .get(backend_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        debug!(backend = %backend_id, instances = instances.len(), "Resolved service");
        Ok(instances)
    }

    async fn services(&self) -> GatewayResult<Vec<ServiceEntry>> {
        let mut entries: Vec<_> = self
            .services
            .iter()
            .map(|entry| ServiceEntry {
                backend_id: entry.key().clone(),
                instances: entry.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        Ok(entries)
    }
}

/// Round-robin cursor per backend, shared by all requests
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next address for `backend_id`, or `None` if `instances` is empty
    pub fn pick<'a>(&self, backend_id: &str, instances: &'a [Url]) -> Option<&'a Url> {
        if instances.is_empty() {
            return None;
        }
        let next = match self.cursors.get(backend_id) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(backend_id.to_string())
                .or_default()
                .fetch_add(1, Ordering::Relaxed),
        };
        instances.get(next % instances.len())
    }
}
