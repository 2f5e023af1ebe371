//! HTTP API of the compute agent
//!
//! # API Endpoints
//!
//! - `GET /api/v1/capabilities` - latest capability snapshot of this host
//! - `POST /api/v1/instances` - assign devices to an instance (body: `InstanceSpec`)
//! - `DELETE /api/v1/instances/:instance_id` - release the devices of an instance
//! - `GET /api/v1/allocations` - current allocation tables
//!
//! Every response is wrapped in `ApiResponse { success, data, message }`.

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use server::routes;
pub use server::ApiServer;
