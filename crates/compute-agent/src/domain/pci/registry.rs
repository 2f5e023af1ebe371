//! Registration and claiming of passthrough devices.
//!
//! The first sync of the process is an authoritative reset: every unowned device
//! record of the host is destroyed and the configured list is created again.
//! Devices still attached to an instance cannot be re-created yet. They are kept in
//! a pending list and retried by later syncs until their instance lets go.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use api_types::AllocationEntry;
use api_types::PciDeviceInfo;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::validate_and_parse;
use super::PciConfigError;
use super::PciDeviceRecord;
use crate::domain::allocation::AllocationError;
use crate::domain::reporter::CapabilityContributor;
use crate::platform::CreateOutcome;
use crate::platform::PciDeviceStore;
use crate::platform::RegisteredPciDevice;

/// Capability key listing the labels of free devices as a JSON array, one entry per device.
pub const PCI_FREE_LABELS_KEY: &str = "pci_free_labels";

#[derive(Debug, Error)]
pub enum PciSyncError {
    #[error("passthrough configuration is invalid")]
    Config,
    #[error("device store failed during sync")]
    Store,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub destroyed: usize,
    pub created: usize,
    pub deferred: usize,
}

#[derive(Debug, Default)]
struct SyncState {
    initialized: bool,
    pending: Vec<PciDeviceRecord>,
}

pub struct PciPassthroughRegistry {
    host: String,
    config: String,
    store: Arc<dyn PciDeviceStore>,
    state: Mutex<SyncState>,
}

impl PciPassthroughRegistry {
    pub fn new(
        host: impl Into<String>,
        config: impl Into<String>,
        store: Arc<dyn PciDeviceStore>,
    ) -> Self {
        Self {
            host: host.into(),
            config: config.into(),
            store,
            state: Mutex::new(SyncState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check the configured device list without touching the store.
    pub fn validate(&self) -> Result<Vec<PciDeviceRecord>, PciConfigError> {
        validate_and_parse(&self.config, &self.host)
    }

    /// Bring the store in line with the configured devices.
    ///
    /// The first call resets the host's records. Later calls with `init_once` only
    /// retry devices that were busy before. The configuration is validated before
    /// anything is destroyed, so an invalid list registers nothing.
    ///
    /// # Errors
    ///
    /// - [`PciSyncError::Config`] if the device list is invalid
    /// - [`PciSyncError::Store`] if the store fails to destroy or create records
    pub fn sync(
        &self,
        compute_node_id: &str,
        init_once: bool,
    ) -> Result<SyncReport, Report<PciSyncError>> {
        let mut state = self.lock();

        if state.initialized && init_once {
            let pending = std::mem::take(&mut state.pending);
            if pending.is_empty() {
                return Ok(SyncReport::default());
            }
            return self.create_all(&mut state, compute_node_id, pending, 0);
        }

        let records = self.validate().change_context(PciSyncError::Config)?;
        let destroyed = self
            .store
            .destroy_all_on_host(&self.host)
            .change_context(PciSyncError::Store)?;
        state.pending.clear();
        let report = self.create_all(&mut state, compute_node_id, records, destroyed)?;
        state.initialized = true;
        Ok(report)
    }

    fn create_all(
        &self,
        state: &mut SyncState,
        compute_node_id: &str,
        records: Vec<PciDeviceRecord>,
        destroyed: usize,
    ) -> Result<SyncReport, Report<PciSyncError>> {
        let mut report = SyncReport {
            destroyed,
            ..SyncReport::default()
        };
        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            match self.store.create(compute_node_id, &record) {
                Ok(CreateOutcome::Created) => report.created += 1,
                Ok(CreateOutcome::Busy) => {
                    info!(
                        address = %record.address,
                        label = %record.label,
                        "PCI device is busy, deferring registration"
                    );
                    state.pending.push(record);
                }
                Err(e) => {
                    // Unattempted records stay pending too.
                    state.pending.push(record);
                    state.pending.extend(records);
                    report.deferred = state.pending.len();
                    return Err(e.change_context(PciSyncError::Store));
                }
            }
        }
        report.deferred = state.pending.len();
        Ok(report)
    }

    /// Free devices whose owner is no longer a live instance.
    ///
    /// Run before the first sync of a restarted agent, so devices of instances that
    /// vanished while the agent was down become registrable again and devices of live
    /// instances stay busy. Returns how many owners were cleared.
    pub fn release_dead_owners(&self, live_instance_ids: &HashSet<String>) -> usize {
        let _guard = self.lock();
        let mut released = 0;
        for device in self.registered() {
            let Some(owner) = device.instance_id.as_deref() else {
                continue;
            };
            if live_instance_ids.contains(owner) {
                continue;
            }
            let address = device.record.address.to_string();
            match self.store.set_owner(&self.host, &address, None) {
                Ok(()) => {
                    info!(
                        target: "allocation",
                        kind = "pci",
                        instance_id = owner,
                        address = %address,
                        "released PCI device of dead instance"
                    );
                    released += 1;
                }
                Err(report) => {
                    error!(address = %address, "failed to release PCI device of dead instance: {report:?}")
                }
            }
        }
        released
    }

    /// Devices that failed to register because they were busy.
    pub fn pending(&self) -> Vec<PciDeviceRecord> {
        self.lock().pending.clone()
    }

    fn registered(&self) -> Vec<RegisteredPciDevice> {
        match self.store.list_on_host(&self.host) {
            Ok(devices) => devices,
            Err(report) => {
                error!(host = %self.host, "failed to list PCI devices: {report:?}");
                Vec::new()
            }
        }
    }

    /// Labels of unowned devices, one per device, sorted.
    pub fn free_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .registered()
            .into_iter()
            .filter(|d| d.instance_id.is_none())
            .map(|d| d.record.label)
            .collect();
        labels.sort();
        labels
    }

    /// Give the instance one free device per requested label. Labels may repeat.
    ///
    /// Either every label is satisfied or nothing is claimed.
    pub fn claim(
        &self,
        instance_id: &str,
        labels: &[String],
    ) -> Result<Vec<PciDeviceInfo>, AllocationError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.lock();

        let mut free: Vec<RegisteredPciDevice> = self
            .store
            .list_on_host(&self.host)
            .map_err(|report| AllocationError::Unavailable {
                message: format!("cannot list PCI devices: {report}"),
            })?
            .into_iter()
            .filter(|d| d.instance_id.is_none())
            .collect();
        free.sort_by_key(|d| d.record.address);

        let mut chosen = Vec::with_capacity(labels.len());
        for label in labels {
            let Some(pos) = free.iter().position(|d| &d.record.label == label) else {
                warn!(
                    target: "allocation",
                    instance_id,
                    label = %label,
                    "no free PCI device for label"
                );
                return Err(AllocationError::PciDeviceUnavailable {
                    label: label.clone(),
                });
            };
            chosen.push(free.remove(pos).record);
        }

        let mut claimed: Vec<PciDeviceInfo> = Vec::with_capacity(chosen.len());
        for record in &chosen {
            let address = record.address.to_string();
            if let Err(report) = self.store.set_owner(&self.host, &address, Some(instance_id)) {
                // The store may have taken the owner before failing to persist it.
                let attempted = claimed.iter().map(|d| d.address.as_str()).chain([address.as_str()]);
                for done in attempted {
                    if let Err(report) = self.store.set_owner(&self.host, done, None) {
                        error!(address = %done, "failed to roll back PCI claim: {report:?}");
                    }
                }
                return Err(AllocationError::Unavailable {
                    message: format!("cannot claim PCI device {address}: {report}"),
                });
            }
            claimed.push(PciDeviceInfo {
                label: record.label.clone(),
                address,
            });
        }

        info!(
            target: "allocation",
            kind = "pci",
            instance_id,
            devices = ?claimed,
            "claimed PCI devices"
        );
        Ok(claimed)
    }

    /// Free every device the instance owns. Returns how many were freed.
    pub fn release(&self, instance_id: &str) -> usize {
        let _guard = self.lock();
        let mut released = 0;
        for device in self.registered() {
            if device.instance_id.as_deref() != Some(instance_id) {
                continue;
            }
            let address = device.record.address.to_string();
            match self.store.set_owner(&self.host, &address, None) {
                Ok(()) => released += 1,
                Err(report) => {
                    error!(instance_id, address = %address, "failed to release PCI device: {report:?}")
                }
            }
        }
        if released > 0 {
            info!(target: "allocation", kind = "pci", instance_id, released, "released PCI devices");
        }
        released
    }

    pub fn entries(&self) -> Vec<AllocationEntry<PciDeviceInfo>> {
        let mut by_instance: BTreeMap<String, Vec<PciDeviceInfo>> = BTreeMap::new();
        for device in self.registered() {
            if let Some(owner) = device.instance_id {
                by_instance.entry(owner).or_default().push(PciDeviceInfo {
                    label: device.record.label,
                    address: device.record.address.to_string(),
                });
            }
        }
        by_instance
            .into_iter()
            .map(|(instance_id, handles)| AllocationEntry {
                instance_id,
                handles,
            })
            .collect()
    }
}

impl CapabilityContributor for PciPassthroughRegistry {
    fn update_status(&self, status: &mut BTreeMap<String, String>) {
        match serde_json::to_string(&self.free_labels()) {
            Ok(labels) => {
                status.insert(PCI_FREE_LABELS_KEY.to_string(), labels);
            }
            Err(e) => error!("failed to encode free PCI labels: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::InMemoryPciDeviceStore;

    const TWO_FPGAS: &str = r#"[
        {"label": "fpga", "address": "0000:03:00.0"},
        {"label": "fpga", "address": "0000:03:00.1"},
        {"label": "nvme", "address": "0000:04:00.0"}
    ]"#;

    fn registry(config: &str) -> (PciPassthroughRegistry, Arc<InMemoryPciDeviceStore>) {
        let store = Arc::new(InMemoryPciDeviceStore::default());
        (
            PciPassthroughRegistry::new("host1", config, store.clone()),
            store,
        )
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_sync_registers_configured_devices() {
        let (registry, _) = registry(TWO_FPGAS);

        let report = registry.sync("node-1", true).expect("sync should succeed");

        assert_eq!(report.created, 3);
        assert_eq!(registry.free_labels(), labels(&["fpga", "fpga", "nvme"]));
    }

    #[test]
    fn duplicate_address_registers_nothing() {
        let (registry, store) = registry(
            r#"[
                {"label": "first", "address": "AAAA:AA:AA.1"},
                {"label": "second", "address": "AAAA:AA:AA.1"}
            ]"#,
        );

        let err = registry.sync("node-1", false).unwrap_err();

        assert!(matches!(err.current_context(), PciSyncError::Config));
        assert!(store
            .list_on_host("host1")
            .expect("listing should succeed")
            .is_empty());
    }

    #[test]
    fn claim_takes_labels_as_multiset() {
        let (registry, _) = registry(TWO_FPGAS);
        registry.sync("node-1", true).expect("sync should succeed");

        let claimed = registry
            .claim("a", &labels(&["fpga", "fpga"]))
            .expect("two fpgas are free");

        assert_eq!(claimed.len(), 2);
        assert_eq!(registry.free_labels(), labels(&["nvme"]));

        let err = registry.claim("b", &labels(&["fpga"])).unwrap_err();
        assert_eq!(
            err,
            AllocationError::PciDeviceUnavailable {
                label: "fpga".to_string()
            }
        );
    }

    #[test]
    fn failed_claim_claims_nothing() {
        let (registry, _) = registry(TWO_FPGAS);
        registry.sync("node-1", true).expect("sync should succeed");

        assert!(registry
            .claim("a", &labels(&["nvme", "gpu"]))
            .is_err());

        assert_eq!(registry.free_labels(), labels(&["fpga", "fpga", "nvme"]));
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let (registry, _) = registry(TWO_FPGAS);
        registry.sync("node-1", true).expect("sync should succeed");
        registry
            .claim("a", &labels(&["nvme"]))
            .expect("nvme is free");

        assert_eq!(registry.release("a"), 1);
        assert_eq!(registry.release("a"), 0);
        assert_eq!(registry.free_labels().len(), 3);
    }

    #[test]
    fn busy_devices_are_retried_on_later_syncs() {
        let (first, store) = registry(TWO_FPGAS);
        first.sync("node-1", true).expect("sync should succeed");
        first
            .claim("a", &labels(&["nvme"]))
            .expect("nvme is free");

        // A restarted agent shares the store but not the process state.
        let restarted = PciPassthroughRegistry::new("host1", TWO_FPGAS, store.clone());
        let report = restarted.sync("node-1", true).expect("sync should succeed");

        assert_eq!(report.created, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(restarted.pending().len(), 1);

        restarted.release("a");
        let report = restarted.sync("node-1", true).expect("retry should succeed");

        assert_eq!(report.created, 1);
        assert!(restarted.pending().is_empty());
        assert_eq!(restarted.free_labels(), labels(&["fpga", "fpga", "nvme"]));
    }

    #[test]
    fn later_sync_without_init_once_resets_again() {
        let (registry, store) = registry(TWO_FPGAS);
        registry.sync("node-1", true).expect("sync should succeed");

        let report = registry.sync("node-1", false).expect("resync should succeed");

        assert_eq!(report.destroyed, 3);
        assert_eq!(report.created, 3);
        assert_eq!(store.list_on_host("host1").expect("should list").len(), 3);
    }

    #[test]
    fn status_lists_free_labels() {
        let (registry, _) = registry(TWO_FPGAS);
        registry.sync("node-1", true).expect("sync should succeed");
        registry.claim("a", &labels(&["fpga"])).expect("fpga is free");

        let mut status = BTreeMap::new();
        registry.update_status(&mut status);

        assert_eq!(
            status.get(PCI_FREE_LABELS_KEY).map(String::as_str),
            Some(r#"["fpga","nvme"]"#)
        );
    }

    #[test]
    fn restart_frees_devices_of_dead_instances_only() {
        // Arrange
        let (first, store) = registry(TWO_FPGAS);
        first.sync("node-1", true).expect("sync should succeed");
        first.claim("live", &labels(&["fpga"])).expect("fpga is free");
        first.claim("gone", &labels(&["nvme"])).expect("nvme is free");
        let restarted = PciPassthroughRegistry::new("host1", TWO_FPGAS, store.clone());

        // Act
        let released = restarted.release_dead_owners(&HashSet::from(["live".to_string()]));
        let report = restarted.sync("node-1", true).expect("sync should succeed");

        // Assert
        assert_eq!(released, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(restarted.free_labels(), labels(&["fpga", "nvme"]));
        assert_eq!(restarted.entries().len(), 1);
        assert_eq!(restarted.entries()[0].instance_id, "live");
    }

    #[test]
    fn status_keeps_labels_containing_commas() {
        let (registry, _) = registry(
            r#"[
                {"label": "fpga,x", "address": "0000:03:00.0"},
                {"label": "nvme", "address": "0000:04:00.0"}
            ]"#,
        );
        registry.sync("node-1", true).expect("sync should succeed");

        let mut status = BTreeMap::new();
        registry.update_status(&mut status);

        let advertised: Vec<String> = serde_json::from_str(&status[PCI_FREE_LABELS_KEY])
            .expect("free labels should be a JSON array");
        assert_eq!(advertised, labels(&["fpga,x", "nvme"]));
    }
}
