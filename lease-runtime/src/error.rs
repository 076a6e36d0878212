use std::fmt;

/// Errors returned by lease node operations.
///
/// Boundary operations collapse these into a boolean `status`; the tagged
/// form stays available through the `try_*` variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The runtime could not satisfy the requested resources or image.
    ResourceUnavailable(String),
    /// The container runtime could not be reached or enumerated.
    RuntimeAccess(String),
    /// Authorization secret or renter key did not match the stored record.
    AuthMismatch(String),
    /// Allocation record missing, corrupt or unreadable.
    Persistence(String),
    /// A peer round-trip did not complete in time.
    TransportTimeout(String),
    /// A peer round-trip failed for a reason other than a timeout.
    Transport(String),
    /// The external job facility rejected a call.
    Scheduling(String),
    /// Invalid input or configuration.
    Validation(String),
}

impl LeaseError {
    /// Short, stable name of the error kind, used in logs and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            LeaseError::ResourceUnavailable(_) => "resource_unavailable",
            LeaseError::RuntimeAccess(_) => "runtime_access",
            LeaseError::AuthMismatch(_) => "auth_mismatch",
            LeaseError::Persistence(_) => "persistence",
            LeaseError::TransportTimeout(_) => "transport_timeout",
            LeaseError::Transport(_) => "transport",
            LeaseError::Scheduling(_) => "scheduling",
            LeaseError::Validation(_) => "validation",
        }
    }
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::ResourceUnavailable(msg) => write!(f, "resource unavailable: {msg}"),
            LeaseError::RuntimeAccess(msg) => write!(f, "runtime access error: {msg}"),
            LeaseError::AuthMismatch(msg) => write!(f, "auth mismatch: {msg}"),
            LeaseError::Persistence(msg) => write!(f, "persistence error: {msg}"),
            LeaseError::TransportTimeout(msg) => write!(f, "transport timeout: {msg}"),
            LeaseError::Transport(msg) => write!(f, "transport error: {msg}"),
            LeaseError::Scheduling(msg) => write!(f, "scheduling error: {msg}"),
            LeaseError::Validation(msg) => write!(f, "validation error: {msg}"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<LeaseError> for String {
    fn from(err: LeaseError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
