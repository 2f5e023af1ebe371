//! Domain logic of the compute agent: capabilities, device allocators and reporting.

pub mod allocation;
pub mod capability;
pub mod compute_host;
pub mod gpu;
pub mod infiniband;
pub mod intent;
pub mod pci;
pub mod reporter;

pub use compute_host::ComputeHost;
