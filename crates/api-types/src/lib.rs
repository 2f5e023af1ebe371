//! Shared API type definitions
//!
//! This crate contains the wire types exchanged between the compute agent and the
//! scheduler: instance descriptions, host capability snapshots, device assignments
//! and the generic response envelope used by the agent's HTTP API.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Instance identifier (UUID string).
pub type InstanceId = String;

/// Free-form key/value map used for capabilities, metadata and extra specs.
pub type StringMap = BTreeMap<String, String>;

/// An instance as seen by the spawn path: its size plus both sources of device intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstanceSpec {
    /// Instance UUID
    pub uuid: InstanceId,
    /// Hypervisor-level instance name, used for the isolation boundary path
    pub name: String,
    /// Owning project
    #[serde(default)]
    pub project_id: Option<String>,
    /// Requested virtual CPUs
    #[serde(default)]
    pub vcpus: u64,
    /// Requested memory in MB
    #[serde(default)]
    pub memory_mb: u64,
    /// Requested local disk in GB
    #[serde(default)]
    pub local_gb: u64,
    /// Per-instance metadata (user overrides)
    #[serde(default)]
    pub metadata: StringMap,
    /// Flavor extra specs
    #[serde(default)]
    pub extra_specs: StringMap,
}

/// Point-in-time capability and capacity report of one host service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// Host name
    pub host: String,
    /// Service class, e.g. "compute"
    pub service: String,
    /// Total virtual CPUs
    pub vcpus: u64,
    /// Virtual CPUs claimed by running instances
    pub vcpus_used: u64,
    /// Memory claimed-capacity total in MB
    pub memory_mb: u64,
    /// Memory claimed by running instances in MB
    pub memory_mb_used: u64,
    /// Memory currently free on the host in MB
    pub host_memory_free: u64,
    /// Disk total in GB
    pub disk_total: u64,
    /// Disk used in GB
    pub disk_used: u64,
    /// Accelerator total
    pub xpus: u64,
    /// Accelerators assigned to instances
    pub xpus_used: u64,
    /// Static capabilities plus device keys folded in by the allocators
    pub capabilities: StringMap,
    /// When the snapshot was built on the host
    pub timestamp: DateTime<Utc>,
}

impl HostCapabilities {
    pub fn vcpus_free(&self) -> u64 {
        self.vcpus.saturating_sub(self.vcpus_used)
    }

    pub fn disk_free(&self) -> u64 {
        self.disk_total.saturating_sub(self.disk_used)
    }

    pub fn xpus_free(&self) -> u64 {
        self.xpus.saturating_sub(self.xpus_used)
    }
}

/// Infiniband PCI function handed to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfinibandFunction {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Generic passthrough PCI device handed to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceInfo {
    pub label: String,
    pub address: String,
}

/// Everything assigned to an instance on the spawn path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceAssignment {
    pub instance_id: InstanceId,
    pub infiniband: Option<InfinibandFunction>,
    pub gpus: Vec<u32>,
    pub pci_devices: Vec<PciDeviceInfo>,
}

/// One row of an allocation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry<H> {
    pub instance_id: InstanceId,
    pub handles: Vec<H>,
}

/// Current allocation tables of every allocator on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationReport {
    pub infiniband: Vec<AllocationEntry<InfinibandFunction>>,
    pub infiniband_free: usize,
    pub gpus: Vec<AllocationEntry<u32>>,
    pub gpus_free: usize,
    pub pci_devices: Vec<AllocationEntry<PciDeviceInfo>>,
    pub pci_free_labels: Vec<String>,
}

/// Outcome of releasing an instance's devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReleaseSummary {
    pub instance_id: InstanceId,
    pub infiniband_released: usize,
    pub gpus_released: usize,
    pub pci_devices_released: usize,
}

/// Response envelope of the agent API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_spec_defaults_optional_fields() {
        let json = r#"{"uuid": "4f1d0c3a-0000-4000-8000-000000000001", "name": "instance-00000001"}"#;

        let spec: InstanceSpec = serde_json::from_str(json).expect("should parse minimal spec");

        assert_eq!(spec.vcpus, 0);
        assert!(spec.metadata.is_empty());
        assert!(spec.extra_specs.is_empty());
        assert_eq!(spec.project_id, None);
    }

    #[test]
    fn free_counters_saturate() {
        let caps = HostCapabilities {
            host: "host1".to_string(),
            service: "compute".to_string(),
            vcpus: 4,
            vcpus_used: 6,
            memory_mb: 0,
            memory_mb_used: 0,
            host_memory_free: 0,
            disk_total: 97,
            disk_used: 92,
            xpus: 1,
            xpus_used: 1,
            capabilities: StringMap::new(),
            timestamp: Utc::now(),
        };

        assert_eq!(caps.vcpus_free(), 0);
        assert_eq!(caps.disk_free(), 5);
        assert_eq!(caps.xpus_free(), 0);
    }

    #[test]
    fn failed_response_has_no_data() {
        let response: ApiResponse<u32> = ApiResponse::failed("nope");
        assert!(!response.success);
        assert!(response.data.is_none());
        assert_eq!(response.message, "nope");
    }
}
