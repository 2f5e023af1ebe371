use std::sync::Arc;

use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::get_allocations;
use super::handlers::get_capabilities;
use super::handlers::prepare_instance;
use super::handlers::release_instance;
use crate::domain::reporter::CapabilityReporter;
use crate::domain::ComputeHost;

/// HTTP API of the compute agent
pub struct ApiServer {
    host: Arc<ComputeHost>,
    reporter: Arc<CapabilityReporter>,
    listen_addr: String,
}

/// Build the agent routes.
pub fn routes(host: Arc<ComputeHost>, reporter: Arc<CapabilityReporter>) -> impl Endpoint {
    Route::new()
        .at("/api/v1/capabilities", get(get_capabilities))
        .at("/api/v1/instances", post(prepare_instance))
        .at("/api/v1/instances/:instance_id", delete(release_instance))
        .at("/api/v1/allocations", get(get_allocations))
        .data(host)
        .data(reporter)
        .with(Tracing)
}

impl ApiServer {
    pub fn new(host: Arc<ComputeHost>, reporter: Arc<CapabilityReporter>, listen_addr: String) -> Self {
        Self {
            host,
            reporter,
            listen_addr,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.host, self.reporter);
        let listener = TcpListener::bind(self.listen_addr.clone());
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        })
                        .attach_printable(format!("listen address: {}", self.listen_addr)))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
