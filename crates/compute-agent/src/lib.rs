pub mod api;
pub mod app;
pub mod config;
pub mod domain;
mod infrastructure;
pub mod platform;

// Re-export main modules
pub use domain::allocation;
pub use domain::capability;
pub use domain::gpu;
pub use domain::infiniband;
pub use domain::pci;
pub use domain::reporter;
pub use domain::ComputeHost;
pub use infrastructure::logging;
