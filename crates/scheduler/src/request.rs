//! What an instance needs from a host.

use std::collections::BTreeMap;

use api_types::InstanceSpec;
use api_types::StringMap;
use serde::Deserialize;
use serde::Serialize;

use crate::error::SchedulerError;

pub const CPU_ARCH_KEY: &str = "cpu_arch";
pub const XPUS_KEY: &str = "xpus";
pub const PCI_LABELS_KEY: &str = "pci_passthrough:labels";
/// Device counts advertised by the host allocators as free counts.
pub const DEVICE_COUNT_KEYS: [&str; 2] = ["gpus", "ib_devices"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub instance_id: Option<String>,
    /// `None` matches any architecture.
    pub cpu_arch: Option<String>,
    pub vcpus: u64,
    pub memory_mb: u64,
    pub local_gb: u64,
    pub xpus: Option<u64>,
    /// Requested free count per device key.
    pub devices: BTreeMap<String, u64>,
    /// Passthrough labels, may repeat.
    pub pci_labels: Vec<String>,
    /// Free-form requirements matched against the host capability tags.
    pub tags: BTreeMap<String, String>,
}

fn is_reserved(key: &str) -> bool {
    key == CPU_ARCH_KEY || key == XPUS_KEY || key == PCI_LABELS_KEY || DEVICE_COUNT_KEYS.contains(&key)
}

fn parse_count(key: &str, token: &str, raw: &str) -> Result<u64, SchedulerError> {
    token.parse::<u64>().map_err(|_| SchedulerError::InvalidRequest {
        message: format!("`{raw}` is not a count for `{key}`"),
    })
}

/// `max(metadata, extra specs)`. Extra-spec values may carry an operator (`">= 2"`).
fn requested_count(
    key: &str,
    metadata: &StringMap,
    extra_specs: &StringMap,
) -> Result<Option<u64>, SchedulerError> {
    let from_metadata = metadata
        .get(key)
        .map(|raw| parse_count(key, raw.trim(), raw))
        .transpose()?;
    let from_flavor = extra_specs
        .get(key)
        .map(|raw| parse_count(key, raw.split_whitespace().last().unwrap_or_default(), raw))
        .transpose()?;
    Ok(from_metadata.max(from_flavor))
}

impl PlacementRequest {
    /// Build the request of an instance.
    ///
    /// Extra specs override metadata for the architecture and tags. Counts take
    /// the larger of both sources.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidRequest`] if a count or the PCI label list does not parse.
    pub fn from_instance(spec: &InstanceSpec) -> Result<Self, SchedulerError> {
        let mut merged = spec.metadata.clone();
        merged.extend(spec.extra_specs.clone());

        let xpus = requested_count(XPUS_KEY, &spec.metadata, &spec.extra_specs)?;

        let mut devices = BTreeMap::new();
        for key in DEVICE_COUNT_KEYS {
            if let Some(count) = requested_count(key, &spec.metadata, &spec.extra_specs)? {
                if count > 0 {
                    devices.insert(key.to_string(), count);
                }
            }
        }

        let pci_labels = match spec.extra_specs.get(PCI_LABELS_KEY) {
            Some(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
                SchedulerError::InvalidRequest {
                    message: format!("`{PCI_LABELS_KEY}` is not a JSON list of labels: {e}"),
                }
            })?,
            None => Vec::new(),
        };

        let tags = merged
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            instance_id: (!spec.uuid.is_empty()).then(|| spec.uuid.clone()),
            cpu_arch: merged.get(CPU_ARCH_KEY).cloned(),
            vcpus: spec.vcpus,
            memory_mb: spec.memory_mb,
            local_gb: spec.local_gb,
            xpus,
            devices,
            pci_labels,
            tags,
        })
    }
}
