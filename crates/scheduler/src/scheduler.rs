//! Picks a host for a placement request.

use std::sync::Arc;

use api_types::HostCapabilities;
use chrono::DateTime;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::SchedulerError;
use crate::filters::default_filters;
use crate::filters::HostFilter;
use crate::host_state::HostStateManager;
use crate::request::PlacementRequest;

/// How a host is chosen among the candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Uniformly at random.
    #[default]
    Random,
    /// The first candidate by host name.
    FirstFit,
}

pub struct ResourceAwareScheduler {
    hosts: Arc<HostStateManager>,
    filters: Vec<Box<dyn HostFilter>>,
    policy: SelectionPolicy,
}

impl ResourceAwareScheduler {
    pub fn new(hosts: Arc<HostStateManager>, policy: SelectionPolicy) -> Self {
        Self::with_filters(hosts, policy, default_filters())
    }

    pub fn with_filters(
        hosts: Arc<HostStateManager>,
        policy: SelectionPolicy,
        filters: Vec<Box<dyn HostFilter>>,
    ) -> Self {
        Self {
            hosts,
            filters,
            policy,
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Fresh hosts of `topic` passing every filter, ordered by host name.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NoHostsAvailable`] if no host ever reported for `topic`.
    pub fn filter_hosts(
        &self,
        topic: &str,
        request: &PlacementRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<HostCapabilities>, SchedulerError> {
        if self.hosts.known_hosts(topic) == 0 {
            return Err(SchedulerError::NoHostsAvailable {
                topic: topic.to_string(),
            });
        }

        let snapshot = self.hosts.hosts_capabilities(topic, now);
        Ok(snapshot
            .into_iter()
            .filter(|host| {
                self.filters.iter().all(|filter| {
                    let passes = filter.host_passes(host, request);
                    if !passes {
                        debug!(host = %host.host, filter = filter.name(), "host filtered out");
                    }
                    passes
                })
            })
            .collect())
    }

    /// Pick a host for the request.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NoHostsAvailable`] if no host ever reported for `topic`
    /// - [`SchedulerError::NoValidHost`] if no fresh host satisfies the request
    pub fn schedule(&self, topic: &str, request: &PlacementRequest) -> Result<String, SchedulerError> {
        self.schedule_with_rng(topic, request, Utc::now(), &mut rand::thread_rng())
    }

    pub fn schedule_with_rng<R: Rng + ?Sized>(
        &self,
        topic: &str,
        request: &PlacementRequest,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<String, SchedulerError> {
        let candidates = self.filter_hosts(topic, request, now)?;

        let chosen = match self.policy {
            SelectionPolicy::Random => candidates.choose(rng),
            SelectionPolicy::FirstFit => candidates.first(),
        };

        match chosen {
            Some(host) => {
                info!(
                    host = %host.host,
                    instance_id = ?request.instance_id,
                    candidates = candidates.len(),
                    "selected host"
                );
                Ok(host.host.clone())
            }
            None => {
                let fresh = self.hosts.hosts_capabilities(topic, now).len();
                warn!(
                    topic,
                    instance_id = ?request.instance_id,
                    fresh_hosts = fresh,
                    "no host satisfies the request"
                );
                Err(SchedulerError::NoValidHost {
                    topic: topic.to_string(),
                    candidates: fresh,
                })
            }
        }
    }
}
