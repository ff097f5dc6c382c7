//! Provider boundary
//!
//! A provider turns owner and repository names into opened resources. Remote
//! API clients and git object stores live behind this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::ProviderError;

/// Opens owners and repositories on a remote host.
///
/// Opening is expensive, which is what the registry caches. Closing is
/// dropping: a reclaimed resource is torn down by its `Drop` impl.
pub trait Provider: Send + Sync + 'static {
    type Owner: Send + Sync + 'static;
    type Repository: Send + 'static;

    fn open_owner(&self, name: &str) -> Result<Self::Owner, ProviderError>;

    /// Names of the repositories `owner` has on the host.
    fn list_repositories(&self, owner: &Self::Owner) -> Result<Vec<String>, ProviderError>;

    fn open_repository(
        &self,
        owner: &Self::Owner,
        name: &str,
    ) -> Result<Self::Repository, ProviderError>;
}

// == Static Provider ==
/// In-memory provider serving a fixed set of owners and repositories.
///
/// Owner lookups ignore case, repository lookups do not, like the hosting
/// services the registry fronts. Counts every open so callers can observe
/// cache hits.
#[derive(Debug, Default)]
pub struct StaticProvider {
    owners: HashMap<String, Vec<String>>,
    opened: AtomicUsize,
    listed: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

/// Owner opened by a [`StaticProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticOwner {
    pub name: String,
    pub repositories: Vec<String>,
}

/// Repository opened by a [`StaticProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRepository {
    pub owner: String,
    pub name: String,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an owner and its repositories.
    pub fn with_owner(mut self, owner: &str, repositories: &[&str]) -> Self {
        self.owners.insert(
            owner.to_uppercase(),
            repositories.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    /// Makes the next open of `name` fail with a remote error.
    pub fn fail_next(&self, name: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(name.to_string());
        }
    }

    /// Number of successful opens so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of successful repository listings so far.
    pub fn listed(&self) -> usize {
        self.listed.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, name: &str) -> Option<ProviderError> {
        let mut failures = self.failures.lock().ok()?;
        let index = failures.iter().position(|f| f == name)?;
        failures.remove(index);
        Some(ProviderError::Remote(format!("injected failure for {}", name)))
    }
}

impl Provider for StaticProvider {
    type Owner = StaticOwner;
    type Repository = StaticRepository;

    fn open_owner(&self, name: &str) -> Result<StaticOwner, ProviderError> {
        if let Some(err) = self.injected_failure(name) {
            return Err(err);
        }
        let repositories = self
            .owners
            .get(&name.to_uppercase())
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(StaticOwner {
            name: name.to_string(),
            repositories: repositories.clone(),
        })
    }

    fn list_repositories(&self, owner: &StaticOwner) -> Result<Vec<String>, ProviderError> {
        if let Some(err) = self.injected_failure(&owner.name) {
            return Err(err);
        }
        self.listed.fetch_add(1, Ordering::SeqCst);
        Ok(owner.repositories.clone())
    }

    fn open_repository(
        &self,
        owner: &StaticOwner,
        name: &str,
    ) -> Result<StaticRepository, ProviderError> {
        if let Some(err) = self.injected_failure(name) {
            return Err(err);
        }
        if !owner.repositories.iter().any(|r| r == name) {
            return Err(ProviderError::NotFound(format!("{}/{}", owner.name, name)));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(StaticRepository {
            owner: owner.name.clone(),
            name: name.to_string(),
        })
    }
}
