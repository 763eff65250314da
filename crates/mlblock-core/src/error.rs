//! Error taxonomy shared by the kernel and project services.

use thiserror::Error;

use crate::adapters::RuntimeError;
use crate::state::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by kernel and project operations.
///
/// The first group are client-facing conditions that are reported as-is
/// and never retried. `Upstream` and `Runtime` are failures of a
/// collaborator (webhook, kernel service, container substrate); `Store`
/// is an internal fault.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("{0} is not ready")]
    NotReady(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn kernel_not_found(kernel_id: &str) -> Self {
        Self::NotFound(format!("kernel {kernel_id}"))
    }

    pub fn project_not_found(project_id: &str) -> Self {
        Self::NotFound(format!("project {project_id}"))
    }

    /// True for failures of an outbound collaborator.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Runtime(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
