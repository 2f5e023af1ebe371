//! Device allocation core shared by the Infiniband and GPU allocators.

mod allocator;
mod store;
mod table;

pub use allocator::DeviceAllocator;
pub use store::AllocationStore;
pub use store::LoadOutcome;
pub use store::read_versioned;
pub use store::write_versioned;
pub use store::StoreError;
pub use table::AllocationState;
pub use table::AllocationTable;
pub use table::DeviceHandle;
pub use table::ReconcileReport;

use thiserror::Error;

/// Errors surfaced to the spawn path by device allocators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("requested {requested} devices but only {available} are available")]
    Overcommit { requested: usize, available: usize },

    #[error("instance {instance_id} already holds devices from this allocator")]
    AlreadyAllocated { instance_id: String },

    #[error("invalid device request for `{key}`: {reason}")]
    InvalidRequest { key: String, reason: String },

    #[error("failed to grant device access to instance {instance_id}: {message}")]
    Isolation {
        instance_id: String,
        message: String,
    },

    #[error("no passthrough device labelled `{label}` is free")]
    PciDeviceUnavailable { label: String },

    #[error("allocator is not usable: {message}")]
    Unavailable { message: String },
}
