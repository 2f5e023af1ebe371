//! Application module
//!
//! Wiring of the agent: building the allocators from the daemon arguments,
//! running the background tasks and shutting them down.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
