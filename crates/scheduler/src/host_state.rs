//! Capability snapshots received from the host agents.
//!
//! Every `(host, service)` pair keeps the last snapshot it reported together with
//! the time it was received. A snapshot older than three periodic intervals is
//! stale and is not offered to the filters.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use api_types::HostCapabilities;
use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::info;

const STALENESS_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone)]
struct ServiceState {
    capabilities: HostCapabilities,
    received_at: DateTime<Utc>,
}

/// `host -> service -> last report`.
#[derive(Debug)]
pub struct HostStateManager {
    periodic_interval: Duration,
    service_states: RwLock<BTreeMap<String, BTreeMap<String, ServiceState>>>,
}

impl HostStateManager {
    pub fn new(periodic_interval: Duration) -> Self {
        Self {
            periodic_interval,
            service_states: RwLock::new(BTreeMap::new()),
        }
    }

    /// Age after which a report no longer counts.
    pub fn allowed_age(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.periodic_interval * STALENESS_MULTIPLIER)
            .unwrap_or(chrono::Duration::MAX)
    }

    fn is_fresh(&self, state: &ServiceState, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(state.received_at) <= self.allowed_age()
    }

    /// Record a capability broadcast received now.
    pub fn update_service_capabilities(&self, capabilities: HostCapabilities) {
        self.update_service_capabilities_at(capabilities, Utc::now());
    }

    pub fn update_service_capabilities_at(
        &self,
        capabilities: HostCapabilities,
        received_at: DateTime<Utc>,
    ) {
        debug!(
            host = %capabilities.host,
            service = %capabilities.service,
            "received service capabilities"
        );
        let mut states = self
            .service_states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states
            .entry(capabilities.host.clone())
            .or_default()
            .insert(
                capabilities.service.clone(),
                ServiceState {
                    capabilities,
                    received_at,
                },
            );
    }

    /// Hosts that ever reported a `service` snapshot, fresh or not.
    pub fn known_hosts(&self, service: &str) -> usize {
        self.service_states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|services| services.contains_key(service))
            .count()
    }

    /// Fresh `service` snapshots at `now`, ordered by host name.
    pub fn hosts_capabilities(&self, service: &str, now: DateTime<Utc>) -> Vec<HostCapabilities> {
        self.service_states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter_map(|services| services.get(service))
            .filter(|state| self.is_fresh(state, now))
            .map(|state| state.capabilities.clone())
            .collect()
    }

    /// Unknown pairs count as stale.
    pub fn host_service_caps_stale(&self, host: &str, service: &str, now: DateTime<Utc>) -> bool {
        self.service_states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
            .and_then(|services| services.get(service))
            .map_or(true, |state| !self.is_fresh(state, now))
    }

    /// Forget stale services, and hosts left with none. Returns how many services
    /// were removed.
    pub fn delete_expired_host_services(&self, now: DateTime<Utc>) -> usize {
        let mut states = self
            .service_states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut removed = 0;
        states.retain(|host, services| {
            services.retain(|service, state| {
                let fresh = self.is_fresh(state, now);
                if !fresh {
                    info!(host = %host, service = %service, "expiring stale service capabilities");
                    removed += 1;
                }
                fresh
            });
            !services.is_empty()
        });
        removed
    }
}
