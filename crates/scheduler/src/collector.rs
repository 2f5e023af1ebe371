//! Capability broadcast receiver: polls every host agent and feeds the reports
//! into the [`HostStateManager`].

use std::sync::Arc;
use std::time::Duration;

use api_types::ApiResponse;
use api_types::HostCapabilities;
use async_trait::async_trait;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use futures::stream;
use futures::StreamExt;
use thiserror::Error;
use tokio::select;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::host_state::HostStateManager;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("request to {source_name} failed")]
    Request { source_name: String },
    #[error("{source_name} answered without capabilities: {message}")]
    Rejected {
        source_name: String,
        message: String,
    },
}

/// Somewhere a host's capability snapshot can be fetched from.
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<HostCapabilities, Report<CollectError>>;
}

/// Agent HTTP API, `GET {base_url}/api/v1/capabilities`.
pub struct HttpCapabilitySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCapabilitySource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CapabilitySource for HttpCapabilitySource {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self) -> Result<HostCapabilities, Report<CollectError>> {
        let request_error = || CollectError::Request {
            source_name: self.base_url.clone(),
        };
        let url = format!("{}/api/v1/capabilities", self.base_url);
        let response: ApiResponse<HostCapabilities> = self
            .client
            .get(&url)
            .send()
            .await
            .change_context_lazy(request_error)?
            .error_for_status()
            .change_context_lazy(request_error)?
            .json()
            .await
            .change_context_lazy(request_error)
            .attach_printable_lazy(|| format!("url: {url}"))?;

        match response.data {
            Some(capabilities) if response.success => Ok(capabilities),
            _ => Err(Report::new(CollectError::Rejected {
                source_name: self.base_url.clone(),
                message: response.message,
            })),
        }
    }
}

pub struct CapabilityCollector {
    sources: Vec<Arc<dyn CapabilitySource>>,
    hosts: Arc<HostStateManager>,
    max_concurrency: usize,
}

impl CapabilityCollector {
    pub fn new(
        sources: Vec<Arc<dyn CapabilitySource>>,
        hosts: Arc<HostStateManager>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            sources,
            hosts,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Poll every source once, at most `max_concurrency` at a time.
    /// Returns how many reports were recorded.
    pub async fn poll_once(&self) -> usize {
        let results: Vec<_> = stream::iter(self.sources.iter().cloned())
            .map(|source| async move {
                let result = source.fetch().await;
                (source, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut recorded = 0;
        for (source, result) in results {
            match result {
                Ok(capabilities) => {
                    debug!(source = source.name(), host = %capabilities.host, "collected capabilities");
                    self.hosts.update_service_capabilities(capabilities);
                    recorded += 1;
                }
                Err(report) => warn!(source = source.name(), "failed to collect capabilities: {report:?}"),
            }
        }
        recorded
    }

    /// Poll every `period` and expire stale reports until cancelled.
    pub async fn run(&self, period: Duration, cancellation_token: CancellationToken) {
        info!(
            sources = self.sources.len(),
            period_secs = period.as_secs(),
            "starting capability collector"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("capability collector shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let recorded = self.poll_once().await;
                    let expired = self.hosts.delete_expired_host_services(Utc::now());
                    debug!(recorded, expired, "capability poll finished");
                }
            }
        }
    }
}
