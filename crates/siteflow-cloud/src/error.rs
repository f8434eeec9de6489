//! Engine error types

use crate::provider::ProviderError;
use siteflow_core::SiteError;
use thiserror::Error;

/// Errors raised by the convergence engine and its collaborators
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Invalid desired spec: {0}")]
    Spec(SiteError),

    #[error("Provider error on {node}: {source}")]
    Provider {
        node: String,
        #[source]
        source: ProviderError,
    },

    #[error("Validation of {node} timed out waiting for {condition}")]
    ValidationTimeout { node: String, condition: String },

    #[error("State conflict on {node}: expected version {expected}, found {actual}")]
    StateConflict {
        node: String,
        expected: u64,
        actual: u64,
    },

    #[error("Cannot delete {node}: still required by {dependents:?}")]
    DependencyViolation {
        node: String,
        dependents: Vec<String>,
    },

    #[error("Unresolved reference {reference} in {node}")]
    UnresolvedReference { node: String, reference: String },

    #[error("Resource kind of {node} changed from {from} to {to}; remove it and declare it again")]
    KindChanged {
        node: String,
        from: String,
        to: String,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SiteError> for CloudError {
    fn from(err: SiteError) -> Self {
        match err {
            SiteError::Cycle(nodes) => CloudError::Cycle(nodes),
            other => CloudError::Spec(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
