//! Error types for the sync agent
//!
//! Catalog misses are kept separate from everything else so callers can treat
//! an absent object store as a plain negative answer.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::EndpointType;

/// Errors raised by service catalog lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// No endpoint of this type for the service in the region
    #[error("{endpoint_type} endpoint for {service_type} service in {region} region not found")]
    EndpointNotFound {
        service_type: String,
        endpoint_type: EndpointType,
        region: String,
    },
}

impl CatalogError {
    pub fn endpoint_not_found(
        service_type: impl Into<String>,
        endpoint_type: EndpointType,
        region: impl Into<String>,
    ) -> Self {
        CatalogError::EndpointNotFound {
            service_type: service_type.into(),
            endpoint_type,
            region: region.into(),
        }
    }

    /// Service type the failed lookup was for
    pub fn service_type(&self) -> &str {
        match self {
            CatalogError::EndpointNotFound { service_type, .. } => service_type,
        }
    }
}

/// Errors loading `identity.yaml` / `mirrors.yaml`
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file does not exist yet
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    /// File could not be read or parsed
    #[error("Error in {} configuration file: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// One or more keys are present but null
    #[error("Configuration value missing in {}: {}", path.display(), keys.join(", "))]
    MissingValues { path: PathBuf, keys: Vec<String> },

    /// Identity API version we cannot talk to
    #[error("Unsupported identity API version: {0}")]
    UnsupportedApiVersion(String),
}

/// Errors that end a sync run
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Identity service request failed
    #[error("Identity service error: {0}")]
    Identity(String),

    /// External command exited unsuccessfully or could not be spawned
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn identity(msg: impl Into<String>) -> Self {
        SyncError::Identity(msg.into())
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// The image service has not registered its endpoints yet.
    ///
    /// Glance usually appears in the catalog a little after the identity
    /// relation is made; the next scheduled run picks it up.
    pub fn is_image_endpoint_missing(&self) -> bool {
        matches!(self, SyncError::Catalog(e) if e.service_type() == "image")
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Identity(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
