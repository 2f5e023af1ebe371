use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::allocation::AllocationStore;
use crate::domain::capability::CapabilityDescriptor;
use crate::domain::gpu::GpuAllocator;
use crate::domain::infiniband::InfinibandAllocator;
use crate::domain::pci::PciPassthroughRegistry;
use crate::domain::pci::PciSyncError;
use crate::domain::reporter::CapabilityContributor;
use crate::domain::reporter::CapabilityReporter;
use crate::domain::reporter::ResourceLedger;
use crate::domain::ComputeHost;
use crate::platform::CgroupIsolation;
use crate::platform::DirectoryInstanceLister;
use crate::platform::FilePciDeviceStore;
use crate::platform::LinuxHostResources;
use crate::platform::VirtDriver;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    ///
    /// Parses the host capabilities, reconciles every allocator against the live
    /// instances and registers the configured PCI devices. An invalid capability
    /// or PCI device list fails the build.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let descriptor = CapabilityDescriptor::parse(&args.capabilities)
            .context("invalid host capabilities")?;

        let live_instance_ids = DirectoryInstanceLister::new(&args.instances_path)
            .list_live_instance_ids()
            .map_err(|e| anyhow::anyhow!("Failed to list live instances: {e:?}"))?;
        tracing::info!(
            live_instances = live_instance_ids.len(),
            "listed live instances"
        );

        let infiniband = Arc::new(
            InfinibandAllocator::init(
                &descriptor,
                AllocationStore::new(args.ib_usage_path()),
                &live_instance_ids,
            )
            .context("invalid Infiniband capabilities")?,
        );

        let isolation = Arc::new(CgroupIsolation::new(
            &args.dev_cgroups_path,
            &args.instances_path,
            &args.guest_environment_file,
        ));
        let gpus = Arc::new(
            GpuAllocator::init(
                &descriptor,
                args.gpu_device_nodes(),
                AllocationStore::new(args.gpu_usage_path()),
                isolation,
                &live_instance_ids,
            )
            .context("invalid GPU capabilities")?,
        );

        let pci = Arc::new(PciPassthroughRegistry::new(
            args.host.clone(),
            args.pci_passthrough_devices.clone(),
            Arc::new(FilePciDeviceStore::open(args.pci_usage_path())),
        ));
        let released = pci.release_dead_owners(&live_instance_ids);
        if released > 0 {
            tracing::info!(released, "released PCI devices of dead instances");
        }
        match pci.sync(args.compute_node_id(), false) {
            Ok(report) => tracing::info!(
                created = report.created,
                destroyed = report.destroyed,
                deferred = report.deferred,
                "registered PCI passthrough devices"
            ),
            Err(e) if matches!(e.current_context(), PciSyncError::Config) => {
                return Err(anyhow::anyhow!("Invalid PCI passthrough devices: {e:?}"));
            }
            Err(e) => tracing::error!("PCI device registration failed, will retry: {e:?}"),
        }

        let ledger = Arc::new(ResourceLedger::open(args.ledger_path(), &live_instance_ids));
        let reporter = Arc::new(CapabilityReporter::new(
            args.host.clone(),
            args.compute_node_id().to_string(),
            descriptor,
            vec![
                infiniband.clone() as Arc<dyn CapabilityContributor>,
                gpus.clone() as Arc<dyn CapabilityContributor>,
                pci.clone() as Arc<dyn CapabilityContributor>,
            ],
            gpus.clone(),
            pci.clone(),
            ledger.clone(),
            Arc::new(LinuxHostResources::default()),
            args.instances_path.clone(),
        ));

        let host = Arc::new(ComputeHost::new(infiniband, gpus, pci.clone(), ledger));

        Ok(Application::new(
            ApplicationServices {
                host,
                reporter,
                pci,
            },
            self.daemon_args,
        ))
    }
}
