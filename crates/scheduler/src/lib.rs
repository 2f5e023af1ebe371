//! Resource-aware scheduler for heterogeneous compute hosts.
//!
//! Host agents report capability snapshots ([`api_types::HostCapabilities`]); the
//! [`HostStateManager`] keeps the latest fresh one per host and the
//! [`ResourceAwareScheduler`] filters them against a [`PlacementRequest`].

pub mod collector;
pub mod error;
pub mod filters;
pub mod host_state;
pub mod request;
pub mod scheduler;

pub use collector::CapabilityCollector;
pub use collector::CapabilitySource;
pub use collector::HttpCapabilitySource;
pub use error::SchedulerError;
pub use host_state::HostStateManager;
pub use request::PlacementRequest;
pub use scheduler::ResourceAwareScheduler;
pub use scheduler::SelectionPolicy;

/// Topic of the compute host agents.
pub const COMPUTE_TOPIC: &str = "compute";
