//! Capability traits for the providers on either side of the migration.
//!
//! The pipeline only ever talks to these traits. Concrete clients live in the
//! submodules and are picked from the config at startup.

pub mod credentials;
pub mod google_photos;
pub mod local;

use std::sync::Arc;

use color_eyre::eyre::{Context, Result};
use futures::stream::BoxStream;
use reqwest::StatusCode;

use crate::config::{Config, DestinationConfig, SourceConfig};

/// Adapter failures as the core sees them. Rate limits, network trouble and
/// auth expiry are transient; anything retrying cannot fix is permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        let message = format!("{context}: HTTP {status}");
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::from_status(status, "Request failed"),
            None if error.is_decode() => Self::Permanent(format!("Malformed response: {error}")),
            None => Self::Transient(format!("Request failed: {error}")),
        }
    }
}

/// An entry of the source listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveredItem {
    pub source_id: String,
    pub file_name: Option<String>,
    pub size_bytes: Option<i64>,
    /// Unix seconds.
    pub created_at: Option<i64>,
}

impl DiscoveredItem {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

/// What the destination gets to know about an asset besides its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub source_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    pub id: String,
    pub name: String,
}

pub type ItemStream = BoxStream<'static, Result<DiscoveredItem, AdapterError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Enumerate the whole source library. Each call starts a fresh listing.
    fn list_items(&self) -> ItemStream;

    async fn fetch(&self, source_id: &str) -> Result<Vec<u8>, AdapterError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Upload content, returning the destination's identifier for it.
    async fn upload(&self, bytes: Vec<u8>, metadata: &ItemMetadata)
    -> Result<String, AdapterError>;

    /// Find the collection called `name`, creating it when missing.
    async fn ensure_collection(&self, name: &str) -> Result<CollectionHandle, AdapterError>;

    async fn add_to_collection(
        &self,
        destination_id: &str,
        collection: &CollectionHandle,
    ) -> Result<(), AdapterError>;
}

/// Supplies valid access tokens. Refresh and expiry are its own business.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AdapterError>;
}

pub fn source_from_config(config: &Config) -> Result<Arc<dyn SourceAdapter>> {
    match config.source() {
        SourceConfig::LocalDirectory { path } => {
            let root = config.expand_path(path);
            let source = local::LocalDirectorySource::new(&root)
                .wrap_err_with(|| format!("Failed to open source directory {}", root.display()))?;
            Ok(Arc::new(source))
        }
    }
}

pub fn destination_from_config(config: &Config) -> Result<Arc<dyn DestinationAdapter>> {
    match config.destination() {
        DestinationConfig::LocalDirectory { path } => {
            let root = config.expand_path(path);
            let destination = local::LocalDirectoryDestination::new(&root).wrap_err_with(|| {
                format!("Failed to open destination directory {}", root.display())
            })?;
            Ok(Arc::new(destination))
        }
        DestinationConfig::GooglePhotos { token_file } => {
            let token_file = config.expand_path(token_file);
            let credentials = credentials::TokenFileCredentials::load(&token_file)?;
            Ok(Arc::new(google_photos::GooglePhotosDestination::new(
                Arc::new(credentials),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(AdapterError::from_status(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(AdapterError::from_status(StatusCode::UNAUTHORIZED, "x").is_transient());
        assert!(AdapterError::from_status(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(!AdapterError::from_status(StatusCode::NOT_FOUND, "x").is_transient());
        assert!(!AdapterError::from_status(StatusCode::BAD_REQUEST, "x").is_transient());
    }
}
