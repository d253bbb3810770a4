use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiveError {
    #[error("not_found: {0}")]
    NotFound(String),

    #[error("computation_failure: {0}")]
    ComputationFailure(String),

    #[error("persistence_failure: {0}")]
    PersistenceFailure(String),

    /// Only ever produced by a socket. Never leaves the dispatch path.
    #[error("delivery_failure: {0}")]
    DeliveryFailure(String),

    #[error("unknown_topic: {0}")]
    UnknownTopic(String),

    #[error("unknown_channel: {0}")]
    UnknownChannel(String),

    #[error("connection_limit: {0} connections already open")]
    ConnectionLimit(usize),

    #[error("config: {0}")]
    Config(String),
}

impl LiveError {
    /// Stable snake_case name, used in failure logs and error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::NotFound(_) => "not_found",
            LiveError::ComputationFailure(_) => "computation_failure",
            LiveError::PersistenceFailure(_) => "persistence_failure",
            LiveError::DeliveryFailure(_) => "delivery_failure",
            LiveError::UnknownTopic(_) => "unknown_topic",
            LiveError::UnknownChannel(_) => "unknown_channel",
            LiveError::ConnectionLimit(_) => "connection_limit",
            LiveError::Config(_) => "config",
        }
    }
}

pub type LiveResult<T> = Result<T, LiveError>;
