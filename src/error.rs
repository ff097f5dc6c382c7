//! Error types for the registry
//!
//! Provides unified error handling using thiserror. The cache itself has no
//! failure modes; everything here comes from opening resources.

use thiserror::Error;

// == Provider Error ==
/// Failure reported by a [`Provider`](crate::registry::Provider) while opening
/// a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote has no such owner or repository
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote could not be reached or answered with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// Local object store could not be prepared
    #[error("Storage error: {0}")]
    Storage(String),
}

// == Registry Error Enum ==
/// Unified error type for the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Opening the resource failed
    #[error("Failed to open '{name}': {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },

    /// The handle refers to an entry that is no longer cached
    #[error("Stale handle: {0}")]
    StaleHandle(String),
}

// == Result Type Alias ==
/// Convenience Result type for the registry.
pub type Result<T> = std::result::Result<T, RegistryError>;
