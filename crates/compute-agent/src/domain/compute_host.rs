//! Spawn and destroy paths of the host agent.

use std::sync::Arc;

use api_types::AllocationReport;
use api_types::DeviceAssignment;
use api_types::InstanceSpec;
use api_types::ReleaseSummary;
use tracing::info;
use tracing::warn;

use super::allocation::AllocationError;
use super::gpu::GpuAllocator;
use super::infiniband::InfinibandAllocator;
use super::intent;
use super::pci::PciPassthroughRegistry;
use super::reporter::ResourceLedger;

/// Every allocator of the host, owned by the agent and shared with the API.
pub struct ComputeHost {
    infiniband: Arc<InfinibandAllocator>,
    gpus: Arc<GpuAllocator>,
    pci: Arc<PciPassthroughRegistry>,
    ledger: Arc<ResourceLedger>,
}

impl ComputeHost {
    pub fn new(
        infiniband: Arc<InfinibandAllocator>,
        gpus: Arc<GpuAllocator>,
        pci: Arc<PciPassthroughRegistry>,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        Self {
            infiniband,
            gpus,
            pci,
            ledger,
        }
    }

    /// Assign every device the instance asks for.
    ///
    /// Either the instance gets everything or nothing stays assigned to it.
    ///
    /// # Errors
    ///
    /// Returns the first [`AllocationError`] raised by an allocator.
    #[tracing::instrument(skip(self, spec), fields(instance_id = %spec.uuid))]
    pub fn prepare_instance(&self, spec: &InstanceSpec) -> Result<DeviceAssignment, AllocationError> {
        let pci_labels = intent::requested_pci_labels(&spec.extra_specs)?;

        let infiniband = self.infiniband.assign(spec)?;

        let gpus = match self.gpus.assign(spec) {
            Ok(gpus) => gpus,
            Err(e) => {
                self.rollback(&spec.uuid, infiniband.is_some(), false);
                return Err(e);
            }
        };

        let pci_devices = match self.pci.claim(&spec.uuid, &pci_labels) {
            Ok(devices) => devices,
            Err(e) => {
                self.rollback(&spec.uuid, infiniband.is_some(), !gpus.is_empty());
                return Err(e);
            }
        };

        self.ledger.record(spec);

        info!(
            infiniband = ?infiniband,
            gpus = ?gpus,
            pci_devices = pci_devices.len(),
            "instance devices prepared"
        );
        Ok(DeviceAssignment {
            instance_id: spec.uuid.clone(),
            infiniband,
            gpus,
            pci_devices,
        })
    }

    // Only undoes what this call assigned, an earlier assignment of the same
    // instance stays intact.
    fn rollback(&self, instance_id: &str, infiniband: bool, gpus: bool) {
        warn!(instance_id, "rolling back partial device assignment");
        if infiniband {
            self.infiniband.deassign(instance_id);
        }
        if gpus {
            self.gpus.deassign(instance_id);
        }
    }

    /// Free everything the instance holds. Releasing an unknown instance is a no-op.
    pub fn release_instance(&self, instance_id: &str) -> ReleaseSummary {
        let summary = ReleaseSummary {
            instance_id: instance_id.to_string(),
            infiniband_released: self.infiniband.deassign(instance_id),
            gpus_released: self.gpus.deassign(instance_id),
            pci_devices_released: self.pci.release(instance_id),
        };
        self.ledger.remove(instance_id);
        summary
    }

    pub fn allocations(&self) -> AllocationReport {
        AllocationReport {
            infiniband: self.infiniband.entries(),
            infiniband_free: self.infiniband.free_count(),
            gpus: self.gpus.entries(),
            gpus_free: self.gpus.free_count(),
            pci_devices: self.pci.entries(),
            pci_free_labels: self.pci.free_labels(),
        }
    }
}
