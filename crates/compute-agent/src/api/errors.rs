use core::error::Error;

use poem::http::StatusCode;

use crate::domain::allocation::AllocationError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// HTTP status answering a failed allocation.
pub fn allocation_status(error: &AllocationError) -> StatusCode {
    match error {
        AllocationError::Overcommit { .. }
        | AllocationError::AlreadyAllocated { .. }
        | AllocationError::PciDeviceUnavailable { .. } => StatusCode::CONFLICT,
        AllocationError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        AllocationError::Isolation { .. } | AllocationError::Unavailable { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "Internal server error".to_string(),
        };
        assert_eq!(
            server_error.to_string(),
            "Server error: Internal server error"
        );
    }

    #[test]
    fn capacity_errors_are_conflicts() {
        let overcommit = AllocationError::Overcommit {
            requested: 2,
            available: 1,
        };
        let invalid = AllocationError::InvalidRequest {
            key: "gpus".to_string(),
            reason: "not a number".to_string(),
        };

        assert_eq!(allocation_status(&overcommit), StatusCode::CONFLICT);
        assert_eq!(allocation_status(&invalid), StatusCode::BAD_REQUEST);
    }
}
