use std::sync::Arc;

use api_types::AllocationReport;
use api_types::ApiResponse;
use api_types::DeviceAssignment;
use api_types::HostCapabilities;
use api_types::InstanceSpec;
use api_types::ReleaseSummary;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use tracing::info;
use tracing::warn;

use super::errors::allocation_status;
use crate::domain::reporter::CapabilityReporter;
use crate::domain::ComputeHost;

fn join_error(e: tokio::task::JoinError) -> poem::Error {
    poem::Error::from_string(
        format!("worker task failed: {e}"),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

/// Latest capability snapshot of this host
#[handler]
pub async fn get_capabilities(
    reporter: Data<&Arc<CapabilityReporter>>,
) -> poem::Result<Json<ApiResponse<HostCapabilities>>> {
    let snapshot = match reporter.latest() {
        Some(snapshot) => snapshot,
        None => {
            let reporter = Arc::clone(reporter.0);
            tokio::task::spawn_blocking(move || reporter.refresh())
                .await
                .map_err(join_error)?
        }
    };
    Ok(Json(ApiResponse::ok(snapshot, "Host capabilities")))
}

/// Assign every device an instance asks for
#[handler]
pub async fn prepare_instance(
    Json(spec): Json<InstanceSpec>,
    host: Data<&Arc<ComputeHost>>,
) -> poem::Result<(StatusCode, Json<ApiResponse<DeviceAssignment>>)> {
    let instance_id = spec.uuid.clone();
    let host = Arc::clone(host.0);
    let result = tokio::task::spawn_blocking(move || host.prepare_instance(&spec))
        .await
        .map_err(join_error)?;

    match result {
        Ok(assignment) => {
            info!(instance_id = %instance_id, "instance prepared");
            Ok((
                StatusCode::OK,
                Json(ApiResponse::ok(
                    assignment,
                    format!("Devices assigned to instance {instance_id}"),
                )),
            ))
        }
        Err(e) => {
            warn!(instance_id = %instance_id, "failed to prepare instance: {e}");
            Ok((allocation_status(&e), Json(ApiResponse::failed(e.to_string()))))
        }
    }
}

/// Release every device of an instance
#[handler]
pub async fn release_instance(
    Path(instance_id): Path<String>,
    host: Data<&Arc<ComputeHost>>,
) -> poem::Result<Json<ApiResponse<ReleaseSummary>>> {
    let host = Arc::clone(host.0);
    let summary = tokio::task::spawn_blocking(move || host.release_instance(&instance_id))
        .await
        .map_err(join_error)?;
    let message = format!("Devices of instance {} released", summary.instance_id);
    Ok(Json(ApiResponse::ok(summary, message)))
}

/// Current allocation tables
#[handler]
pub async fn get_allocations(
    host: Data<&Arc<ComputeHost>>,
) -> poem::Result<Json<ApiResponse<AllocationReport>>> {
    let host = Arc::clone(host.0);
    let report = tokio::task::spawn_blocking(move || host.allocations())
        .await
        .map_err(join_error)?;
    Ok(Json(ApiResponse::ok(report, "Allocation tables")))
}
