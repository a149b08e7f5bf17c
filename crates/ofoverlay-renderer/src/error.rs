//! Error types for the policy renderer.

use ofoverlay_common::{ConfigurationError, OrdinalError, StoreError};
use ofoverlay_types::{EndpointGroupId, TenantId};
use std::path::PathBuf;
use thiserror::Error;

/// Failure of one pipeline stage for one switch.
///
/// Scoped to that (stage, switch) pair: the run logs it and carries on
/// without the stage's flows for the switch.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Tenant {0} not found in policy")]
    MissingTenant(TenantId),

    #[error("Endpoint group {group} not found in tenant {tenant}")]
    MissingGroup {
        tenant: TenantId,
        group: EndpointGroupId,
    },

    #[error("Cannot resolve {kind} for {target}")]
    UnresolvedContext { kind: &'static str, target: String },

    #[error("Ordinal allocation failed: {0}")]
    Ordinal(#[from] OrdinalError),

    #[error("{0}")]
    Internal(String),
}

impl StageError {
    /// True for errors that mean "no policy for this endpoint yet".
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            StageError::MissingTenant(_)
                | StageError::MissingGroup { .. }
                | StageError::UnresolvedContext { .. }
        )
    }
}

/// Top-level renderer errors.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid config file {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, RendererError>;
