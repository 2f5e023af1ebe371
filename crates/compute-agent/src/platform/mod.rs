//! Host collaborators the allocators depend on.
//!
//! The domain code only sees these traits. The implementations in the submodules
//! talk to the local filesystem: instance directories, device cgroups, the guest
//! root filesystem and `/proc`.

pub mod host_resources;
pub mod instances;
pub mod lxc;
pub mod pci_store;

use std::collections::HashSet;
use std::path::Path;

use api_types::InstanceSpec;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use host_resources::LinuxHostResources;
pub use instances::DirectoryInstanceLister;
pub use lxc::CgroupIsolation;
pub use pci_store::FilePciDeviceStore;
pub use pci_store::InMemoryPciDeviceStore;

use crate::domain::pci::PciDeviceRecord;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("I/O failed on {path}")]
    Io { path: String },

    #[error("failed to read host resource {resource}")]
    HostResource { resource: String },

    #[error("device store rejected the request: {message}")]
    DeviceStore { message: String },
}

/// Hypervisor view of which instances currently exist on this host.
pub trait VirtDriver: Send + Sync {
    fn list_live_instance_ids(&self) -> Result<HashSet<String>, Report<PlatformError>>;
}

/// Mutations of an instance's isolation boundary.
pub trait InstanceIsolation: Send + Sync {
    /// Extend the instance's device allow-list with a character device.
    fn grant_device_access(
        &self,
        instance: &InstanceSpec,
        major: u32,
        minor: u32,
    ) -> Result<(), Report<PlatformError>>;

    /// Make `key=value` visible to the guest environment.
    fn write_guest_environment(
        &self,
        instance: &InstanceSpec,
        key: &str,
        value: &str,
    ) -> Result<(), Report<PlatformError>>;
}

/// Result of registering one passthrough device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The device is still attached to an instance and cannot be re-registered yet.
    Busy,
}

/// Registered passthrough devices, keyed by host and address.
pub trait PciDeviceStore: Send + Sync {
    /// Remove every record of `host` that no instance owns. Returns how many were removed.
    fn destroy_all_on_host(&self, host: &str) -> Result<usize, Report<PlatformError>>;

    fn create(
        &self,
        compute_node_id: &str,
        record: &PciDeviceRecord,
    ) -> Result<CreateOutcome, Report<PlatformError>>;

    fn list_on_host(&self, host: &str) -> Result<Vec<RegisteredPciDevice>, Report<PlatformError>>;

    /// Set or clear the owning instance of the device at `address`.
    fn set_owner(
        &self,
        host: &str,
        address: &str,
        instance_id: Option<&str>,
    ) -> Result<(), Report<PlatformError>>;
}

/// A device as the store knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPciDevice {
    pub compute_node_id: String,
    pub record: PciDeviceRecord,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub free_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskInfo {
    pub total_gb: u64,
    pub used_gb: u64,
}

/// Raw capacity of the host.
pub trait HostResources: Send + Sync {
    fn cpu_count(&self) -> u64;
    fn memory(&self) -> Result<MemoryInfo, Report<PlatformError>>;
    fn disk(&self, path: &Path) -> Result<DiskInfo, Report<PlatformError>>;
}
