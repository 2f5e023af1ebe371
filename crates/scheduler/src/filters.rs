//! Host filters. A host is a candidate only if every filter lets it pass.

use api_types::HostCapabilities;
use tracing::debug;
use tracing::warn;

use crate::request::PlacementRequest;

pub const PCI_FREE_LABELS_KEY: &str = "pci_free_labels";

pub trait HostFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool;
}

/// Architecture must match when the request names one.
pub struct ArchFilter;

impl HostFilter for ArchFilter {
    fn name(&self) -> &'static str {
        "arch"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        let Some(wanted) = &request.cpu_arch else {
            return true;
        };
        host.capabilities.get("cpu_arch") == Some(wanted)
    }
}

/// Free vCPUs, free host memory and free disk must cover the request.
pub struct CapacityFilter;

impl HostFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        request.vcpus <= host.vcpus_free()
            && request.memory_mb <= host.host_memory_free
            && request.local_gb <= host.disk_free()
    }
}

/// Requested accelerators must not exceed the free ones.
pub struct XpuFilter;

impl HostFilter for XpuFilter {
    fn name(&self) -> &'static str {
        "xpus"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        request
            .xpus
            .map_or(true, |wanted| wanted <= host.xpus_free())
    }
}

/// Device counts (`gpus`, `ib_devices`) against the free counts the host advertises.
pub struct DeviceCountFilter;

impl HostFilter for DeviceCountFilter {
    fn name(&self) -> &'static str {
        "device_count"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        request.devices.iter().all(|(key, wanted)| {
            host.capabilities
                .get(key)
                .and_then(|free| free.trim().parse::<u64>().ok())
                .is_some_and(|free| *wanted <= free)
        })
    }
}

/// Values a host offers for a tag.
///
/// The raw value is split on commas. A piece holding quotes offers the text between
/// its last two quotes, so `"a","b"` offers `a` and `b`. Other pieces are offered
/// trimmed.
pub fn offered_values(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(|piece| match piece.rfind('"') {
            Some(right) => {
                let left = piece[..right].rfind('"').map_or(0, |left| left + 1);
                &piece[left..right]
            }
            None => piece.trim(),
        })
        .collect()
}

/// Each requested tag value (comma-separated) must be offered by the host.
pub struct TagFilter;

impl HostFilter for TagFilter {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        request.tags.iter().all(|(key, wanted)| {
            let Some(raw) = host.capabilities.get(key) else {
                debug!(host = %host.host, key = %key, "host does not advertise tag");
                return false;
            };
            let offered = offered_values(raw);
            wanted
                .split(',')
                .map(str::trim)
                .all(|want| offered.contains(&want))
        })
    }
}

/// Free labels a host advertises as a JSON array. A missing or malformed value offers none.
fn free_pci_labels(host: &HostCapabilities) -> Vec<String> {
    let Some(raw) = host.capabilities.get(PCI_FREE_LABELS_KEY) else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(host = %host.host, "ignoring malformed {PCI_FREE_LABELS_KEY}: {e}");
        Vec::new()
    })
}

/// Requested labels must be available as a multiset of the host's free labels.
pub struct PciPassthroughFilter;

impl HostFilter for PciPassthroughFilter {
    fn name(&self) -> &'static str {
        "pci_passthrough"
    }

    fn host_passes(&self, host: &HostCapabilities, request: &PlacementRequest) -> bool {
        if request.pci_labels.is_empty() {
            return true;
        }
        let mut free = free_pci_labels(host);

        for label in &request.pci_labels {
            match free.iter().position(|free_label| free_label == label) {
                Some(pos) => {
                    free.swap_remove(pos);
                }
                None => {
                    debug!(
                        host = %host.host,
                        requested = ?request.pci_labels,
                        "host lacks free PCI labels"
                    );
                    return false;
                }
            }
        }
        true
    }
}

/// Every filter, cheapest first.
pub fn default_filters() -> Vec<Box<dyn HostFilter>> {
    vec![
        Box::new(ArchFilter),
        Box::new(CapacityFilter),
        Box::new(XpuFilter),
        Box::new(DeviceCountFilter),
        Box::new(TagFilter),
        Box::new(PciPassthroughFilter),
    ]
}
