//! Infiniband SR-IOV function allocator.
//!
//! The host exposes virtual functions of one Infiniband card on a single PCI bus.
//! The pool is built from three capabilities:
//!
//! - `ib_bus`: bus number, decimal or `0x` hex
//! - `ib_device_range`: `lo-hi` or a single device number (0..=31)
//! - `ib_function_range`: `lo-hi` or a single function number (0..=7)
//!
//! plus an optional `ib_avoid` list of `device.function` pairs that must never be
//! handed out. Without `ib_bus` the allocator is disabled and every operation is a
//! no-op.

use std::collections::BTreeMap;
use std::collections::HashSet;

use api_types::AllocationEntry;
use api_types::InfinibandFunction;
use api_types::InstanceSpec;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::allocation::AllocationError;
use super::allocation::AllocationStore;
use super::allocation::DeviceAllocator;
use super::capability::CapabilityDescriptor;
use super::capability::CapabilityError;
use super::intent;
use super::reporter::CapabilityContributor;

pub const IB_BUS_KEY: &str = "ib_bus";
pub const IB_DEVICE_RANGE_KEY: &str = "ib_device_range";
pub const IB_FUNCTION_RANGE_KEY: &str = "ib_function_range";
pub const IB_AVOID_KEY: &str = "ib_avoid";

const MAX_DEVICE: u8 = 31;
const MAX_FUNCTION: u8 = 7;

/// One function on the Infiniband bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IbFunction {
    pub device: u8,
    pub function: u8,
}

/// Pool layout parsed from the host capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfinibandConfig {
    pub bus: u8,
    pub devices: (u8, u8),
    pub functions: (u8, u8),
    pub avoid: Vec<IbFunction>,
}

impl InfinibandConfig {
    /// `None` when the host has no Infiniband card configured.
    pub fn from_capabilities(
        descriptor: &CapabilityDescriptor,
    ) -> Result<Option<Self>, CapabilityError> {
        let Some(raw_bus) = descriptor.get(IB_BUS_KEY) else {
            return Ok(None);
        };
        let bus = parse_number(IB_BUS_KEY, raw_bus)?;

        let devices = parse_range(
            IB_DEVICE_RANGE_KEY,
            required(descriptor, IB_DEVICE_RANGE_KEY)?,
            MAX_DEVICE,
        )?;
        let functions = parse_range(
            IB_FUNCTION_RANGE_KEY,
            required(descriptor, IB_FUNCTION_RANGE_KEY)?,
            MAX_FUNCTION,
        )?;
        let avoid = match descriptor.get(IB_AVOID_KEY) {
            Some(raw) => parse_avoid(raw)?,
            None => Vec::new(),
        };

        Ok(Some(Self {
            bus,
            devices,
            functions,
            avoid,
        }))
    }

    /// Device range times function range, minus the avoid list.
    pub fn pool(&self) -> Vec<IbFunction> {
        let (dev_lo, dev_hi) = self.devices;
        let (fn_lo, fn_hi) = self.functions;
        (dev_lo..=dev_hi)
            .flat_map(|device| (fn_lo..=fn_hi).map(move |function| IbFunction { device, function }))
            .filter(|f| !self.avoid.contains(f))
            .collect()
    }
}

fn required<'a>(descriptor: &'a CapabilityDescriptor, key: &str) -> Result<&'a str, CapabilityError> {
    descriptor.get(key).ok_or_else(|| CapabilityError::MissingKey {
        key: key.to_string(),
    })
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> CapabilityError {
    CapabilityError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u8, CapabilityError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse::<u8>(),
    };
    parsed.map_err(|e| invalid(key, raw, e.to_string()))
}

fn parse_range(key: &str, raw: &str, max: u8) -> Result<(u8, u8), CapabilityError> {
    let (lo, hi) = match raw.split_once('-') {
        Some((lo, hi)) => (parse_number(key, lo)?, parse_number(key, hi)?),
        None => {
            let single = parse_number(key, raw)?;
            (single, single)
        }
    };
    if hi > max {
        return Err(invalid(key, raw, format!("upper bound exceeds {max}")));
    }
    if lo > hi {
        return Err(invalid(key, raw, "lower bound is above upper bound"));
    }
    Ok((lo, hi))
}

fn parse_avoid(raw: &str) -> Result<Vec<IbFunction>, CapabilityError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (device, function) = pair
                .split_once('.')
                .ok_or_else(|| invalid(IB_AVOID_KEY, pair, "expected device.function"))?;
            Ok(IbFunction {
                device: parse_number(IB_AVOID_KEY, device)?,
                function: parse_number(IB_AVOID_KEY, function)?,
            })
        })
        .collect()
}

struct ReadyAllocator {
    bus: u8,
    devices: DeviceAllocator<IbFunction>,
}

/// Hands out at most one Infiniband function per instance.
///
/// Built either ready (card configured, table reconciled) or disabled.
pub struct InfinibandAllocator {
    ready: Option<ReadyAllocator>,
}

impl InfinibandAllocator {
    pub fn disabled() -> Self {
        Self { ready: None }
    }

    /// Build the pool from the host capabilities and reconcile the persisted table.
    pub fn init(
        descriptor: &CapabilityDescriptor,
        store: AllocationStore,
        live_instance_ids: &HashSet<String>,
    ) -> Result<Self, CapabilityError> {
        let Some(config) = InfinibandConfig::from_capabilities(descriptor)? else {
            info!("no Infiniband bus configured, Infiniband allocation disabled");
            return Ok(Self::disabled());
        };

        let pool = config.pool();
        info!(
            bus = config.bus,
            devices = ?config.devices,
            functions = ?config.functions,
            avoided = config.avoid.len(),
            pool_size = pool.len(),
            "Infiniband allocator ready"
        );
        Ok(Self {
            ready: Some(ReadyAllocator {
                bus: config.bus,
                devices: DeviceAllocator::open("infiniband", pool, store, live_instance_ids),
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.ready.is_some()
    }

    /// Assign a function to the instance if it asks for one.
    ///
    /// `Ok(None)` means nothing was requested or Infiniband is disabled here.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::InvalidRequest`] if the requested count does not parse
    /// - [`AllocationError::Overcommit`] if no function is free
    pub fn assign(&self, spec: &InstanceSpec) -> Result<Option<InfinibandFunction>, AllocationError> {
        let Some(ready) = &self.ready else {
            return Ok(None);
        };

        let mut needed =
            intent::requested_device_count(intent::IB_DEVICES_KEY, &spec.metadata, &spec.extra_specs)?;
        if needed == 0 {
            return Ok(None);
        }
        if needed > 1 {
            warn!(
                instance_id = %spec.uuid,
                requested = needed,
                "only one Infiniband function is given per instance"
            );
            needed = 1;
        }

        let assigned = ready.devices.assign(&spec.uuid, needed)?;
        Ok(assigned.first().map(|f| InfinibandFunction {
            bus: ready.bus,
            device: f.device,
            function: f.function,
        }))
    }

    /// Return the instance's function to the pool. Returns how many were freed.
    pub fn deassign(&self, instance_id: &str) -> usize {
        self.ready
            .as_ref()
            .map_or(0, |ready| ready.devices.release(instance_id).len())
    }

    pub fn free_count(&self) -> usize {
        self.ready.as_ref().map_or(0, |r| r.devices.free_count())
    }

    pub fn entries(&self) -> Vec<AllocationEntry<InfinibandFunction>> {
        let Some(ready) = &self.ready else {
            return Vec::new();
        };
        ready
            .devices
            .snapshot()
            .allocated()
            .iter()
            .map(|(instance_id, functions)| AllocationEntry {
                instance_id: instance_id.clone(),
                handles: functions
                    .iter()
                    .map(|f| InfinibandFunction {
                        bus: ready.bus,
                        device: f.device,
                        function: f.function,
                    })
                    .collect(),
            })
            .collect()
    }
}

impl CapabilityContributor for InfinibandAllocator {
    fn update_status(&self, status: &mut BTreeMap<String, String>) {
        if self.is_enabled() {
            status.insert(intent::IB_DEVICES_KEY.to_string(), self.free_count().to_string());
        }
    }
}
