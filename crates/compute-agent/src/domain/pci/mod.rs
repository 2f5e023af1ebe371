//! Generic PCI passthrough devices.

mod address;
mod config;
mod registry;

pub use address::PciAddress;
pub use config::validate_and_parse;
pub use config::PciDeviceConfig;
pub use config::PciDeviceRecord;
pub use registry::PciPassthroughRegistry;
pub use registry::PciSyncError;
pub use registry::SyncReport;
pub use registry::PCI_FREE_LABELS_KEY;

use thiserror::Error;

/// Invalid passthrough configuration. Each variant names the offending field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PciConfigError {
    #[error("invalid PCI device list: {reason}")]
    Json { reason: String },

    #[error("invalid PCI address `{address}`, expected DDDD:BB:SS.F")]
    InvalidAddress { address: String },

    #[error("invalid PCI device label `{label}`: length {length} is outside 1..=200")]
    InvalidLabel { label: String, length: usize },

    #[error("invalid vendor_id `{value}` for PCI device {address}, expected 4 hex digits")]
    InvalidVendorId { address: String, value: String },

    #[error("invalid product_id `{value}` for PCI device {address}, expected 4 hex digits")]
    InvalidProductId { address: String, value: String },

    #[error("PCI device with address {address} is listed twice for host {host}")]
    DuplicateAddress { host: String, address: String },
}
