//! Hubcache - reference-counted TTL cache for remote source-control resources
//!
//! Keeps opened owners and repositories around across requests and reclaims
//! the idle ones in the background, without tearing down anything still in use.

pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod tasks;

pub use cache::{Cache, EntryId, EntryList, ExactMap, Expiry, FoldedMap, Guarded};
pub use config::Config;
pub use error::{ProviderError, RegistryError};
pub use registry::{OwnerHandle, Provider, Registry, RepositoryHandle};
pub use tasks::spawn_sweep_task;
