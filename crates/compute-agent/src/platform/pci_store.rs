//! Passthrough device records.
//!
//! [`FilePciDeviceStore`] keeps the records, owners included, in a versioned JSON
//! file under the agent state so that a restarted agent still knows which devices
//! are attached to running instances.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::CreateOutcome;
use super::PciDeviceStore;
use super::PlatformError;
use super::RegisteredPciDevice;
use crate::domain::allocation::read_versioned;
use crate::domain::allocation::write_versioned;
use crate::domain::allocation::LoadOutcome;
use crate::domain::pci::PciDeviceRecord;

/// Device records held by the agent process, keyed by `(host, address)`.
#[derive(Debug, Default)]
pub struct InMemoryPciDeviceStore {
    devices: RwLock<BTreeMap<(String, String), RegisteredPciDevice>>,
}

fn poisoned() -> Report<PlatformError> {
    Report::new(PlatformError::DeviceStore {
        message: "device table lock poisoned".to_string(),
    })
}

impl InMemoryPciDeviceStore {
    pub fn from_devices(devices: Vec<RegisteredPciDevice>) -> Self {
        Self {
            devices: RwLock::new(
                devices
                    .into_iter()
                    .map(|device| {
                        (
                            (device.record.host.clone(), device.record.address.to_string()),
                            device,
                        )
                    })
                    .collect(),
            ),
        }
    }

    /// Every record of every host.
    pub fn all(&self) -> Result<Vec<RegisteredPciDevice>, Report<PlatformError>> {
        let devices = self.devices.read().map_err(|_| poisoned())?;
        Ok(devices.values().cloned().collect())
    }
}

impl PciDeviceStore for InMemoryPciDeviceStore {
    fn destroy_all_on_host(&self, host: &str) -> Result<usize, Report<PlatformError>> {
        let mut devices = self.devices.write().map_err(|_| poisoned())?;
        let before = devices.len();
        devices.retain(|(device_host, _), device| device_host != host || device.instance_id.is_some());
        Ok(before - devices.len())
    }

    fn create(
        &self,
        compute_node_id: &str,
        record: &PciDeviceRecord,
    ) -> Result<CreateOutcome, Report<PlatformError>> {
        let mut devices = self.devices.write().map_err(|_| poisoned())?;
        let key = (record.host.clone(), record.address.to_string());
        if devices
            .get(&key)
            .is_some_and(|existing| existing.instance_id.is_some())
        {
            return Ok(CreateOutcome::Busy);
        }
        devices.insert(
            key,
            RegisteredPciDevice {
                compute_node_id: compute_node_id.to_string(),
                record: record.clone(),
                instance_id: None,
            },
        );
        Ok(CreateOutcome::Created)
    }

    fn list_on_host(&self, host: &str) -> Result<Vec<RegisteredPciDevice>, Report<PlatformError>> {
        let devices = self.devices.read().map_err(|_| poisoned())?;
        Ok(devices
            .iter()
            .filter(|((device_host, _), _)| device_host == host)
            .map(|(_, device)| device.clone())
            .collect())
    }

    fn set_owner(
        &self,
        host: &str,
        address: &str,
        instance_id: Option<&str>,
    ) -> Result<(), Report<PlatformError>> {
        let mut devices = self.devices.write().map_err(|_| poisoned())?;
        let device = devices
            .get_mut(&(host.to_string(), address.to_string()))
            .ok_or_else(|| {
                Report::new(PlatformError::DeviceStore {
                    message: format!("no PCI device {address} registered on {host}"),
                })
            })?;
        device.instance_id = instance_id.map(str::to_string);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDevices {
    devices: Vec<RegisteredPciDevice>,
}

/// Device records mirrored to a JSON file after every change.
#[derive(Debug)]
pub struct FilePciDeviceStore {
    path: PathBuf,
    devices: InMemoryPciDeviceStore,
    writes: Mutex<()>,
}

impl FilePciDeviceStore {
    /// Load the records left by a previous agent, starting empty if there are none.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let devices = Self::read(&path).or_empty(&path);
        info!(
            path = %path.display(),
            devices = devices.len(),
            owned = devices.iter().filter(|d| d.instance_id.is_some()).count(),
            "loaded PCI device records"
        );
        Self {
            path,
            devices: InMemoryPciDeviceStore::from_devices(devices),
            writes: Mutex::new(()),
        }
    }

    /// Read the records on disk without opening a store.
    pub fn read(path: &Path) -> LoadOutcome<Vec<RegisteredPciDevice>> {
        read_versioned::<PersistedDevices>(path).map(|persisted| persisted.devices)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), Report<PlatformError>> {
        let devices = self.devices.all()?;
        write_versioned(&self.path, &PersistedDevices { devices }).change_context(
            PlatformError::Io {
                path: self.path.display().to_string(),
            },
        )
    }

    // Serializes mutate-then-persist so the file never lags behind a later change.
    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PciDeviceStore for FilePciDeviceStore {
    fn destroy_all_on_host(&self, host: &str) -> Result<usize, Report<PlatformError>> {
        let _guard = self.write_guard();
        let destroyed = self.devices.destroy_all_on_host(host)?;
        if destroyed > 0 {
            self.persist()?;
        }
        Ok(destroyed)
    }

    fn create(
        &self,
        compute_node_id: &str,
        record: &PciDeviceRecord,
    ) -> Result<CreateOutcome, Report<PlatformError>> {
        let _guard = self.write_guard();
        let outcome = self.devices.create(compute_node_id, record)?;
        if outcome == CreateOutcome::Created {
            self.persist()?;
        }
        Ok(outcome)
    }

    fn list_on_host(&self, host: &str) -> Result<Vec<RegisteredPciDevice>, Report<PlatformError>> {
        self.devices.list_on_host(host)
    }

    fn set_owner(
        &self,
        host: &str,
        address: &str,
        instance_id: Option<&str>,
    ) -> Result<(), Report<PlatformError>> {
        let _guard = self.write_guard();
        self.devices.set_owner(host, address, instance_id)?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::domain::pci::PciAddress;

    fn record(address: &str) -> PciDeviceRecord {
        PciDeviceRecord {
            host: "host1".to_string(),
            label: "fpga".to_string(),
            address: PciAddress::parse(address).expect("test address should parse"),
            vendor_id: None,
            product_id: None,
        }
    }

    #[test]
    fn owned_devices_survive_destroy_and_block_create() {
        let store = InMemoryPciDeviceStore::default();
        store.create("node", &record("0000:01:00.0")).expect("should create");
        store.create("node", &record("0000:01:00.1")).expect("should create");
        store
            .set_owner("host1", "0000:01:00.0", Some("a"))
            .expect("should set owner");

        let destroyed = store.destroy_all_on_host("host1").expect("should destroy");

        assert_eq!(destroyed, 1);
        assert_eq!(
            store.create("node", &record("0000:01:00.0")).expect("should answer"),
            CreateOutcome::Busy
        );
        assert_eq!(
            store.create("node", &record("0000:01:00.1")).expect("should answer"),
            CreateOutcome::Created
        );
    }

    #[test]
    fn set_owner_of_unknown_device_fails() {
        let store = InMemoryPciDeviceStore::default();
        assert!(store.set_owner("host1", "0000:01:00.0", Some("a")).is_err());
    }

    #[test]
    fn owners_survive_reopen() {
        // Arrange
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("pci_devices.json");
        let store = FilePciDeviceStore::open(&path);
        store.create("node", &record("0000:01:00.0")).expect("should create");
        store.create("node", &record("0000:01:00.1")).expect("should create");
        store
            .set_owner("host1", "0000:01:00.0", Some("a"))
            .expect("should set owner");
        drop(store);

        // Act
        let reopened = FilePciDeviceStore::open(&path);

        // Assert
        let devices = reopened.list_on_host("host1").expect("should list");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].instance_id.as_deref(), Some("a"));
        assert_eq!(devices[1].instance_id, None);
        assert_eq!(
            reopened
                .create("node", &record("0000:01:00.0"))
                .expect("should answer"),
            CreateOutcome::Busy,
            "an owned device must not be registered as free again"
        );
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("pci_devices.json");
        fs::write(&path, b"{not json").expect("should write garbage");

        let store = FilePciDeviceStore::open(&path);

        assert!(matches!(FilePciDeviceStore::read(&path), LoadOutcome::Corrupt(_)));
        assert!(store.list_on_host("host1").expect("should list").is_empty());
    }
}
