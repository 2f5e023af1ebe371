use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Nothing has ever reported for the topic.
    #[error("no hosts available for {topic}")]
    NoHostsAvailable { topic: String },

    /// Hosts exist but none satisfies the request.
    #[error("no valid host for {topic}: none of {candidates} candidate(s) satisfies the request")]
    NoValidHost { topic: String, candidates: usize },

    #[error("invalid placement request: {message}")]
    InvalidRequest { message: String },
}
