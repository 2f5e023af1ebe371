//! GPU allocator for container instances.
//!
//! GPUs are bare indices `0..gpus`. Handing one out means more than bookkeeping:
//! the instance's device cgroup must allow the GPU nodes and the control device,
//! and the guest must learn which indices it can see through `CUDA_VISIBLE_DEVICES`.
//! If either step fails the claim is rolled back.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use api_types::AllocationEntry;
use api_types::InstanceSpec;
use error_stack::Report;
use tracing::info;

use super::allocation::AllocationError;
use super::allocation::AllocationStore;
use super::allocation::DeviceAllocator;
use super::capability::CapabilityDescriptor;
use super::capability::CapabilityError;
use super::intent;
use super::reporter::CapabilityContributor;
use crate::platform::InstanceIsolation;
use crate::platform::PlatformError;

pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Character device numbers of the GPU driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDeviceNodes {
    pub major: u32,
    pub control_minor: u32,
}

impl Default for GpuDeviceNodes {
    fn default() -> Self {
        Self {
            major: 195,
            control_minor: 255,
        }
    }
}

pub struct GpuAllocator {
    total: usize,
    nodes: GpuDeviceNodes,
    devices: Option<DeviceAllocator<u32>>,
    isolation: Arc<dyn InstanceIsolation>,
}

impl GpuAllocator {
    /// Build the pool from the `gpus` capability and reconcile the persisted table.
    ///
    /// A host without `gpus`, or with `gpus:0`, gets a disabled allocator.
    pub fn init(
        descriptor: &CapabilityDescriptor,
        nodes: GpuDeviceNodes,
        store: AllocationStore,
        isolation: Arc<dyn InstanceIsolation>,
        live_instance_ids: &HashSet<String>,
    ) -> Result<Self, CapabilityError> {
        let total = descriptor.parse_value::<u32>(intent::GPUS_KEY)?.unwrap_or(0);
        if total == 0 {
            info!("no GPUs configured, GPU allocation disabled");
            return Ok(Self {
                total: 0,
                nodes,
                devices: None,
                isolation,
            });
        }

        info!(gpus = total, major = nodes.major, "GPU allocator ready");
        Ok(Self {
            total: total as usize,
            nodes,
            devices: Some(DeviceAllocator::open(
                "gpu",
                (0..total).collect(),
                store,
                live_instance_ids,
            )),
            isolation,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.devices.is_some()
    }

    /// Assign the GPUs the instance asks for and expose them to it.
    ///
    /// Returns the assigned indices, empty when nothing was requested.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::InvalidRequest`] if the requested count does not parse
    /// - [`AllocationError::Overcommit`] if not enough GPUs are free, including on a
    ///   host without GPUs
    /// - [`AllocationError::Isolation`] if the instance could not be given access
    pub fn assign(&self, spec: &InstanceSpec) -> Result<Vec<u32>, AllocationError> {
        let needed =
            intent::requested_device_count(intent::GPUS_KEY, &spec.metadata, &spec.extra_specs)?;
        if needed == 0 {
            return Ok(Vec::new());
        }
        let Some(devices) = &self.devices else {
            return Err(AllocationError::Overcommit {
                requested: needed,
                available: 0,
            });
        };

        devices.assign_with(&spec.uuid, needed, |gpus| self.expose(spec, gpus))
    }

    fn expose(&self, spec: &InstanceSpec, gpus: &[u32]) -> Result<(), AllocationError> {
        let isolation_error = |report: Report<PlatformError>| AllocationError::Isolation {
            instance_id: spec.uuid.clone(),
            message: format!("{report}"),
        };

        self.isolation
            .grant_device_access(spec, self.nodes.major, self.nodes.control_minor)
            .map_err(isolation_error)?;
        for gpu in gpus {
            self.isolation
                .grant_device_access(spec, self.nodes.major, *gpu)
                .map_err(isolation_error)?;
        }

        let visible = gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.isolation
            .write_guest_environment(spec, VISIBLE_DEVICES_ENV, &visible)
            .map_err(isolation_error)
    }

    /// Return the instance's GPUs to the pool. Returns how many were freed.
    pub fn deassign(&self, instance_id: &str) -> usize {
        self.devices
            .as_ref()
            .map_or(0, |devices| devices.release(instance_id).len())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn free_count(&self) -> usize {
        self.devices.as_ref().map_or(0, DeviceAllocator::free_count)
    }

    pub fn used_count(&self) -> usize {
        self.total.saturating_sub(self.free_count())
    }

    pub fn entries(&self) -> Vec<AllocationEntry<u32>> {
        let Some(devices) = &self.devices else {
            return Vec::new();
        };
        devices
            .snapshot()
            .allocated()
            .iter()
            .map(|(instance_id, gpus)| AllocationEntry {
                instance_id: instance_id.clone(),
                handles: gpus.clone(),
            })
            .collect()
    }
}

impl CapabilityContributor for GpuAllocator {
    fn update_status(&self, status: &mut BTreeMap<String, String>) {
        if self.is_enabled() {
            status.insert(intent::GPUS_KEY.to_string(), self.free_count().to_string());
        }
    }
}
