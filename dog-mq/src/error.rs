use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for raw backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Coarse error classes, stable across variants.
///
/// Transports map these onto their own status codes; the broker itself only
/// uses them to decide propagation (e.g. idempotent deletes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailed,
    DoesNotExist,
    Conflict,
    NotPermitted,
    MessageConflict,
    NoPoolFound,
    CapabilityMismatch,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::DoesNotExist => "DoesNotExist",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::NotPermitted => "NotPermitted",
            ErrorKind::MessageConflict => "MessageConflict",
            ErrorKind::NoPoolFound => "NoPoolFound",
            ErrorKind::CapabilityMismatch => "CapabilityMismatch",
            ErrorKind::Backend => "Backend",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Failures raised by a storage backend before the broker interprets them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Duplicate key {id} in collection {collection}")]
    DuplicateKey { collection: String, id: String },

    /// Connection to the backend was lost; retried with exponential reconnect backoff
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Transient failure (timeouts, overload); retried with jittered backoff
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend serialization error: {0}")]
    Serialization(String),

    #[error("Backend internal error: {0}")]
    Internal(String),
}

/// How the retry executor treats a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Never,
    Transient,
    Failover,
}

impl BackendError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::ConnectionLost(_) => RetryClass::Failover,
            Self::Unavailable(_) => RetryClass::Transient,
            Self::DuplicateKey { .. } | Self::Serialization(_) | Self::Internal(_) => {
                RetryClass::Never
            }
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Broker error taxonomy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Input rejected before any backend call
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Queue {name} does not exist for project {project}")]
    QueueDoesNotExist { name: String, project: String },

    #[error("Message {id} does not exist in queue {queue} for project {project}")]
    MessageDoesNotExist { id: String, queue: String, project: String },

    #[error("Claim {id} does not exist in queue {queue} for project {project}")]
    ClaimDoesNotExist { id: String, queue: String, project: String },

    #[error("Pool {0} does not exist")]
    PoolDoesNotExist(String),

    #[error("Flavor {0} does not exist")]
    FlavorDoesNotExist(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Message {id} is claimed")]
    MessageIsClaimed { id: String },

    #[error("Message {id} is no longer claimed")]
    MessageNotClaimed { id: String },

    #[error("Message {id} is not claimed by {claim}")]
    MessageNotClaimedBy { id: String, claim: String },

    #[error("Pool {pool} is in use by flavor {flavor}")]
    PoolInUseByFlavor { pool: String, flavor: String },

    #[error(
        "Messages could not be enqueued due to a conflict with other messages \
         in queue {queue} for project {project}"
    )]
    MessageConflict { queue: String, project: String },

    #[error("No pool found")]
    NoPoolFound,

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Retryable backend failure that kept failing until the attempt ceiling
    #[error("{op} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn queue_missing(name: &str, project: &str) -> Self {
        Self::QueueDoesNotExist {
            name: name.to_string(),
            project: project.to_string(),
        }
    }

    pub fn message_missing(id: &str, queue: &str, project: &str) -> Self {
        Self::MessageDoesNotExist {
            id: id.to_string(),
            queue: queue.to_string(),
            project: project.to_string(),
        }
    }

    pub fn claim_missing(id: &str, queue: &str, project: &str) -> Self {
        Self::ClaimDoesNotExist {
            id: id.to_string(),
            queue: queue.to_string(),
            project: project.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed(_) | Self::InvalidConfig(_) => ErrorKind::ValidationFailed,
            Self::QueueDoesNotExist { .. }
            | Self::MessageDoesNotExist { .. }
            | Self::ClaimDoesNotExist { .. }
            | Self::PoolDoesNotExist(_)
            | Self::FlavorDoesNotExist(_) => ErrorKind::DoesNotExist,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::MessageIsClaimed { .. }
            | Self::MessageNotClaimed { .. }
            | Self::MessageNotClaimedBy { .. }
            | Self::PoolInUseByFlavor { .. } => ErrorKind::NotPermitted,
            Self::MessageConflict { .. } => ErrorKind::MessageConflict,
            Self::NoPoolFound => ErrorKind::NoPoolFound,
            Self::CapabilityMismatch(_) => ErrorKind::CapabilityMismatch,
            Self::Backend(_) | Self::RetriesExhausted { .. } => ErrorKind::Backend,
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::DoesNotExist
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::ValidationFailed
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
