//! Periodic host capability snapshots.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::time::Duration;

use api_types::HostCapabilities;
use api_types::InstanceSpec;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::select;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocation::read_versioned;
use super::allocation::write_versioned;
use super::capability::CapabilityDescriptor;
use super::gpu::GpuAllocator;
use super::pci::PciPassthroughRegistry;
use crate::platform::DiskInfo;
use crate::platform::HostResources;
use crate::platform::MemoryInfo;

pub const COMPUTE_SERVICE: &str = "compute";

/// Anything that folds its own keys into the advertised capability map.
pub trait CapabilityContributor: Send + Sync {
    fn update_status(&self, status: &mut BTreeMap<String, String>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub vcpus: u64,
    pub memory_mb: u64,
    pub local_gb: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLedger {
    instances: BTreeMap<String, LedgerTotals>,
}

/// Resources claimed by instances prepared through this agent.
///
/// An opened ledger is written to its file after every change, so the counts of
/// running instances survive an agent restart.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    path: Option<PathBuf>,
    instances: Mutex<BTreeMap<String, LedgerTotals>>,
}

impl ResourceLedger {
    /// Load the ledger file and forget instances that are no longer running.
    pub fn open(path: impl Into<PathBuf>, live_instance_ids: &HashSet<String>) -> Self {
        let path = path.into();
        let mut instances = read_versioned::<PersistedLedger>(&path)
            .or_empty(&path)
            .instances;
        let before = instances.len();
        instances.retain(|instance_id, _| live_instance_ids.contains(instance_id));
        let dropped = before - instances.len();
        info!(
            path = %path.display(),
            instances = instances.len(),
            dropped,
            "loaded resource ledger"
        );

        let ledger = Self {
            path: Some(path),
            instances: Mutex::new(instances),
        };
        if dropped > 0 {
            ledger.persist(&ledger.lock());
        }
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, LedgerTotals>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, instances: &BTreeMap<String, LedgerTotals>) {
        let Some(path) = &self.path else {
            return;
        };
        let persisted = PersistedLedger {
            instances: instances.clone(),
        };
        if let Err(report) = write_versioned(path, &persisted) {
            error!(path = %path.display(), "failed to persist resource ledger: {report:?}");
        }
    }

    pub fn record(&self, spec: &InstanceSpec) {
        let mut instances = self.lock();
        instances.insert(
            spec.uuid.clone(),
            LedgerTotals {
                vcpus: spec.vcpus,
                memory_mb: spec.memory_mb,
                local_gb: spec.local_gb,
            },
        );
        self.persist(&instances);
    }

    /// `true` if the instance was recorded.
    pub fn remove(&self, instance_id: &str) -> bool {
        let mut instances = self.lock();
        let removed = instances.remove(instance_id).is_some();
        if removed {
            self.persist(&instances);
        }
        removed
    }

    pub fn totals(&self) -> LedgerTotals {
        self.lock()
            .values()
            .fold(LedgerTotals::default(), |acc, t| LedgerTotals {
                vcpus: acc.vcpus + t.vcpus,
                memory_mb: acc.memory_mb + t.memory_mb,
                local_gb: acc.local_gb + t.local_gb,
            })
    }
}

/// Builds and keeps the latest [`HostCapabilities`] of this host.
pub struct CapabilityReporter {
    host: String,
    compute_node_id: String,
    descriptor: CapabilityDescriptor,
    contributors: Vec<Arc<dyn CapabilityContributor>>,
    gpus: Arc<GpuAllocator>,
    pci: Arc<PciPassthroughRegistry>,
    ledger: Arc<ResourceLedger>,
    resources: Arc<dyn HostResources>,
    instances_path: PathBuf,
    latest: RwLock<Option<HostCapabilities>>,
}

impl CapabilityReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        compute_node_id: String,
        descriptor: CapabilityDescriptor,
        contributors: Vec<Arc<dyn CapabilityContributor>>,
        gpus: Arc<GpuAllocator>,
        pci: Arc<PciPassthroughRegistry>,
        ledger: Arc<ResourceLedger>,
        resources: Arc<dyn HostResources>,
        instances_path: PathBuf,
    ) -> Self {
        Self {
            host,
            compute_node_id,
            descriptor,
            contributors,
            gpus,
            pci,
            ledger,
            resources,
            instances_path,
            latest: RwLock::new(None),
        }
    }

    /// Static capabilities with every contributor's keys folded in.
    pub fn capability_map(&self) -> BTreeMap<String, String> {
        let mut status = self.descriptor.as_map().clone();
        for contributor in &self.contributors {
            contributor.update_status(&mut status);
        }
        status
    }

    pub fn build_snapshot(&self) -> HostCapabilities {
        let memory = self.resources.memory().unwrap_or_else(|report| {
            warn!("failed to read host memory: {report:?}");
            MemoryInfo::default()
        });
        let disk = self
            .resources
            .disk(&self.instances_path)
            .unwrap_or_else(|report| {
                warn!("failed to read instances disk: {report:?}");
                DiskInfo::default()
            });
        let used = self.ledger.totals();

        HostCapabilities {
            host: self.host.clone(),
            service: COMPUTE_SERVICE.to_string(),
            vcpus: self.resources.cpu_count(),
            vcpus_used: used.vcpus,
            memory_mb: memory.total_mb,
            memory_mb_used: used.memory_mb,
            host_memory_free: memory.free_mb,
            disk_total: disk.total_gb,
            disk_used: disk.used_gb,
            xpus: self.gpus.total() as u64,
            xpus_used: self.gpus.used_count() as u64,
            capabilities: self.capability_map(),
            timestamp: Utc::now(),
        }
    }

    /// Retry deferred PCI registrations, then rebuild the snapshot.
    pub fn refresh(&self) -> HostCapabilities {
        match self.pci.sync(&self.compute_node_id, true) {
            Ok(report) if report.created > 0 || report.destroyed > 0 => {
                info!(
                    created = report.created,
                    destroyed = report.destroyed,
                    deferred = report.deferred,
                    "synchronized PCI devices"
                );
            }
            Ok(_) => {}
            Err(report) => error!("PCI device sync failed: {report:?}"),
        }

        let snapshot = self.build_snapshot();
        debug!(
            vcpus = snapshot.vcpus,
            vcpus_used = snapshot.vcpus_used,
            host_memory_free = snapshot.host_memory_free,
            xpus_used = snapshot.xpus_used,
            "built capability snapshot"
        );
        *self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<HostCapabilities> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Refresh every `period` until cancelled.
    pub async fn run(self: Arc<Self>, period: Duration, cancellation_token: CancellationToken) {
        info!(period_secs = period.as_secs(), "starting capability reporter");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("capability reporter shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let reporter = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || reporter.refresh()).await {
                        error!("capability refresh panicked: {e}");
                    }
                }
            }
        }
    }
}
