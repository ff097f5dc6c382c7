//! Registry Module
//!
//! Owner and repository tables sharing one cache, one lock and one sweep.
//!
//! Owners are looked up case-insensitively; each owner carries its own
//! case-sensitive repository table. A cached repository holds a reference on
//! its owner, so an owner outlives every repository opened through it.
//!
//! Provider calls run without the lock held; the tables are checked again
//! before a freshly opened resource is inserted.

mod provider;

use std::mem;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::{
    Cache, Entry, EntryId, EntryList, ExactMap, Expiry, FoldedMap, Guarded, SweepStats,
};
use crate::config::Config;
use crate::error::{RegistryError, Result};

pub use provider::{Provider, StaticOwner, StaticProvider, StaticRepository};

// == Resource ==
/// Payload stored in the registry's entries.
#[derive(Debug)]
pub enum Resource<O, R> {
    Owner {
        value: Arc<O>,
        repositories: ExactMap,
        /// Repository names, once listed
        listing: Option<Vec<String>>,
    },
    Repository {
        owner: EntryId,
        value: R,
    },
}

type Payload<P> = Resource<<P as Provider>::Owner, <P as Provider>::Repository>;

// == Registry State ==
/// Everything the registry lock protects.
pub struct RegistryState<P: Provider> {
    entries: EntryList<Payload<P>>,
    owners: FoldedMap,
}

impl<P: Provider> RegistryState<P> {
    fn new() -> Self {
        Self {
            entries: EntryList::new(),
            owners: FoldedMap::new(),
        }
    }

    fn owner_value(&self, id: EntryId) -> Option<&Arc<P::Owner>> {
        match self.entries.get(id).map(Entry::payload) {
            Some(Resource::Owner { value, .. }) => Some(value),
            _ => None,
        }
    }

    fn listing(&self, owner: EntryId) -> Option<&[String]> {
        match self.entries.get(owner).map(Entry::payload) {
            Some(Resource::Owner {
                listing: Some(listing),
                ..
            }) => Some(listing),
            _ => None,
        }
    }

    fn repositories(&self, owner: EntryId) -> Option<&ExactMap> {
        match self.entries.get(owner).map(Entry::payload) {
            Some(Resource::Owner { repositories, .. }) => Some(repositories),
            _ => None,
        }
    }

    /// Runs `f` on an owner's repository table alongside the entry list.
    ///
    /// The table lives inside the owner's entry, so it is moved out for the
    /// duration of the call.
    fn with_repositories<T>(
        &mut self,
        owner: EntryId,
        f: impl FnOnce(&mut ExactMap, &mut EntryList<Payload<P>>) -> T,
    ) -> Option<T> {
        let mut repositories = match self.entries.get_mut(owner).map(Entry::payload_mut) {
            Some(Resource::Owner { repositories, .. }) => mem::take(repositories),
            _ => return None,
        };

        let result = f(&mut repositories, &mut self.entries);

        if let Some(Resource::Owner {
            repositories: slot, ..
        }) = self.entries.get_mut(owner).map(Entry::payload_mut)
        {
            *slot = repositories;
        }
        Some(result)
    }

    /// Frees an owner entry together with every repository cached under it.
    fn drop_owner(&mut self, entry: Entry<Payload<P>>) {
        if let Resource::Owner {
            mut repositories, ..
        } = entry.into_payload()
        {
            let dropped = repositories.clear(&mut self.entries);
            debug!("Dropped {} repositories with their owner", dropped.len());
        }
    }
}

impl<P: Provider> Guarded for RegistryState<P> {
    type Payload = Payload<P>;

    fn entries(&mut self) -> &mut EntryList<Payload<P>> {
        &mut self.entries
    }

    fn reclaim(&mut self, id: EntryId, expiry: &Expiry) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        let key = entry.key().to_string();
        let parent = match entry.payload() {
            // Only reachable after an over-release; wait for the repositories
            Resource::Owner { repositories, .. } if !repositories.is_empty() => return false,
            Resource::Owner { .. } => None,
            Resource::Repository { owner, .. } => Some(*owner),
        };

        match parent {
            None => match self.owners.delete_entry(&mut self.entries, &key, id) {
                Some(entry) => {
                    debug!("Reclaimed owner '{}'", key);
                    self.drop_owner(entry);
                    true
                }
                None => false,
            },
            Some(owner) => {
                let removed = self
                    .with_repositories(owner, |repositories, entries| {
                        repositories.delete_entry(entries, &key, id)
                    })
                    .flatten();
                if removed.is_none() {
                    return self.entries.take(id).is_some();
                }
                // Release the reference this repository held on its owner
                expiry.touch(&mut self.entries, owner, -1);
                debug!("Reclaimed repository '{}'", key);
                true
            }
        }
    }
}

// == Handles ==
/// An opened owner. Must be returned through [`Registry::close_owner`].
#[derive(Debug)]
pub struct OwnerHandle {
    id: EntryId,
    name: String,
}

impl OwnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An opened repository. Must be returned through
/// [`Registry::close_repository`].
#[derive(Debug)]
pub struct RepositoryHandle {
    id: EntryId,
    name: String,
}

impl RepositoryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

// == Registry ==
/// Caches opened owners and repositories and reclaims the idle ones.
pub struct Registry<P: Provider> {
    provider: Arc<P>,
    cache: Cache<RegistryState<P>>,
    config: Config,
}

impl<P: Provider> Registry<P> {
    // == Constructor ==
    /// Creates an idle registry with default configuration.
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, Config::default())
    }

    pub fn with_config(provider: P, config: Config) -> Self {
        let state = Arc::new(Mutex::new(RegistryState::new()));
        let cache = Cache::new(state).with_sweep_interval(config.sweep_interval());
        Self {
            provider: Arc::new(provider),
            cache,
            config,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // == Lifecycle ==
    /// Starts reclaiming idle resources with the configured TTL.
    pub fn start(&mut self) {
        self.cache.start(self.config.ttl());
    }

    /// Stops reclaiming; returns once no sweep pass can run anymore.
    pub async fn stop(&mut self) {
        self.cache.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.cache.is_running()
    }

    // == Owners ==
    /// Opens `name`, reusing the cached owner when there is one.
    pub async fn open_owner(&self, name: &str) -> Result<OwnerHandle> {
        {
            let mut guard = self.cache.lock().await;
            let state = &mut *guard;
            if let Some(id) = state.owners.get(name) {
                return Ok(self.acquire_owner(state, id, name));
            }
        }

        let value = self
            .provider
            .open_owner(name)
            .map_err(|source| RegistryError::Provider {
                name: name.to_string(),
                source,
            })?;

        let mut guard = self.cache.lock().await;
        let state = &mut *guard;
        let id = match state.owners.get(name) {
            Some(id) => {
                debug!("Owner '{}' was opened meanwhile, dropping duplicate", name);
                id
            }
            None => {
                let resource = Resource::Owner {
                    value: Arc::new(value),
                    repositories: ExactMap::new(),
                    listing: None,
                };
                let id = state.entries.insert(name, resource, self.cache.deadline());
                state.owners.set(&mut state.entries, name, id, true);
                info!("Opened owner '{}'", name);
                id
            }
        };
        Ok(self.acquire_owner(state, id, name))
    }

    fn acquire_owner(
        &self,
        state: &mut RegistryState<P>,
        id: EntryId,
        name: &str,
    ) -> OwnerHandle {
        self.cache.touch(&mut state.entries, id, 1);
        let name = state
            .entries
            .get(id)
            .map_or_else(|| name.to_string(), |entry| entry.key().to_string());
        OwnerHandle { id, name }
    }

    /// Releases a handle obtained from [`open_owner`](Self::open_owner).
    pub async fn close_owner(&self, owner: OwnerHandle) -> Result<()> {
        let mut state = self.cache.lock().await;
        if self.cache.touch(&mut state.entries, owner.id, -1) {
            Ok(())
        } else {
            Err(RegistryError::StaleHandle(owner.name))
        }
    }

    /// Runs `f` on the opened owner.
    pub async fn with_owner<T>(
        &self,
        owner: &OwnerHandle,
        f: impl FnOnce(&P::Owner) -> T,
    ) -> Result<T> {
        let state = self.cache.lock().await;
        state
            .owner_value(owner.id)
            .map(|value| f(&**value))
            .ok_or_else(|| RegistryError::StaleHandle(owner.name.clone()))
    }

    /// Names of the repositories `owner` has on the remote host.
    ///
    /// Listed through the provider once per cached owner.
    pub async fn repositories(&self, owner: &OwnerHandle) -> Result<Vec<String>> {
        let stale = || RegistryError::StaleHandle(owner.name.clone());
        let value = {
            let state = self.cache.lock().await;
            if let Some(listing) = state.listing(owner.id) {
                return Ok(listing.to_vec());
            }
            Arc::clone(state.owner_value(owner.id).ok_or_else(stale)?)
        };

        let listing = self
            .provider
            .list_repositories(&value)
            .map_err(|source| RegistryError::Provider {
                name: owner.name.clone(),
                source,
            })?;

        let mut state = self.cache.lock().await;
        match state.entries.get_mut(owner.id).map(Entry::payload_mut) {
            Some(Resource::Owner { listing: slot, .. }) => {
                debug!("Listed {} repositories of '{}'", listing.len(), owner.name);
                *slot = Some(listing.clone());
                Ok(listing)
            }
            _ => Err(stale()),
        }
    }

    /// Drops the cached owner `name` and its repositories right away.
    ///
    /// Outstanding handles become stale.
    pub async fn invalidate_owner(&self, name: &str) -> bool {
        let mut guard = self.cache.lock().await;
        let state = &mut *guard;
        match state.owners.delete(&mut state.entries, name) {
            Some(entry) => {
                state.drop_owner(entry);
                info!("Invalidated owner '{}'", name);
                true
            }
            None => false,
        }
    }

    pub async fn owner_count(&self) -> usize {
        self.cache.lock().await.owners.len()
    }

    // == Repositories ==
    /// Opens repository `name` of `owner`, reusing the cached one when there
    /// is one.
    pub async fn open_repository(
        &self,
        owner: &OwnerHandle,
        name: &str,
    ) -> Result<RepositoryHandle> {
        let stale = || RegistryError::StaleHandle(owner.name.clone());
        let owner_value = {
            let mut guard = self.cache.lock().await;
            let state = &mut *guard;
            let cached = state.repositories(owner.id).ok_or_else(stale)?.get(name);
            if let Some(id) = cached {
                self.cache.touch(&mut state.entries, id, 1);
                return Ok(RepositoryHandle {
                    id,
                    name: name.to_string(),
                });
            }
            Arc::clone(state.owner_value(owner.id).ok_or_else(stale)?)
        };

        let value = self
            .provider
            .open_repository(&owner_value, name)
            .map_err(|source| RegistryError::Provider {
                name: format!("{}/{}", owner.name, name),
                source,
            })?;

        let mut guard = self.cache.lock().await;
        let state = &mut *guard;
        let cached = state.repositories(owner.id).ok_or_else(stale)?.get(name);
        let id = match cached {
            Some(id) => {
                debug!(
                    "Repository '{}/{}' was opened meanwhile, dropping duplicate",
                    owner.name, name
                );
                id
            }
            None => {
                let resource = Resource::Repository {
                    owner: owner.id,
                    value,
                };
                let id = state.entries.insert(name, resource, self.cache.deadline());
                state
                    .with_repositories(owner.id, |repositories, entries| {
                        repositories.set(entries, name, id, true);
                    })
                    .ok_or_else(stale)?;
                // The repository keeps its owner alive until reclaimed
                self.cache.touch(&mut state.entries, owner.id, 1);
                info!("Opened repository '{}/{}'", owner.name, name);
                id
            }
        };

        self.cache.touch(&mut state.entries, id, 1);
        Ok(RepositoryHandle {
            id,
            name: name.to_string(),
        })
    }

    /// Releases a handle obtained from [`open_repository`](Self::open_repository).
    pub async fn close_repository(&self, repository: RepositoryHandle) -> Result<()> {
        let mut state = self.cache.lock().await;
        if self.cache.touch(&mut state.entries, repository.id, -1) {
            Ok(())
        } else {
            Err(RegistryError::StaleHandle(repository.name))
        }
    }

    /// Runs `f` on the opened repository.
    pub async fn with_repository<T>(
        &self,
        repository: &RepositoryHandle,
        f: impl FnOnce(&P::Repository) -> T,
    ) -> Result<T> {
        let state = self.cache.lock().await;
        match state.entries.get(repository.id).map(Entry::payload) {
            Some(Resource::Repository { value, .. }) => Ok(f(value)),
            _ => Err(RegistryError::StaleHandle(repository.name.clone())),
        }
    }

    /// Drops the cached repository `name` of `owner` right away.
    pub async fn invalidate_repository(&self, owner: &OwnerHandle, name: &str) -> bool {
        let mut guard = self.cache.lock().await;
        let state = &mut *guard;
        let removed = state
            .with_repositories(owner.id, |repositories, entries| {
                repositories.delete(entries, name)
            })
            .flatten();
        if removed.is_none() {
            return false;
        }
        self.cache.touch(&mut state.entries, owner.id, -1);
        info!("Invalidated repository '{}/{}'", owner.name, name);
        true
    }

    /// Number of repositories cached under `owner`.
    pub async fn repository_count(&self, owner: &OwnerHandle) -> Result<usize> {
        let state = self.cache.lock().await;
        state
            .repositories(owner.id)
            .map(ExactMap::len)
            .ok_or_else(|| RegistryError::StaleHandle(owner.name.clone()))
    }

    // == Stats ==
    pub async fn stats(&self) -> SweepStats {
        self.cache.lock().await.entries.stats()
    }

    /// Runs one sweep pass right away.
    pub async fn sweep_now(&self) -> usize {
        self.cache.sweep_now().await.reclaimed
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_secs(1);

    fn state_with_repository() -> (RegistryState<StaticProvider>, EntryId, EntryId, Instant) {
        let provider = StaticProvider::new().with_owner("billziss-gh", &["hubfs"]);
        let mut state = RegistryState::new();
        let now = Instant::now();
        let expiry = Expiry::new(now, TTL);

        let value = provider.open_owner("billziss-gh").unwrap();
        let owner = state.entries.insert(
            "billziss-gh",
            Resource::Owner {
                value: Arc::new(value),
                repositories: ExactMap::new(),
                listing: None,
            },
            now + TTL,
        );
        state.owners.set(&mut state.entries, "billziss-gh", owner, true);

        let value = provider
            .open_repository(state.owner_value(owner).unwrap(), "hubfs")
            .unwrap();
        let repo = state
            .entries
            .insert("hubfs", Resource::Repository { owner, value }, now + TTL);
        state.with_repositories(owner, |repositories, entries| {
            repositories.set(entries, "hubfs", repo, true);
        });
        // The repository's hold on its owner
        expiry.touch(&mut state.entries, owner, 1);

        (state, owner, repo, now)
    }

    /// Counts provider calls made while the registry lock is held.
    #[derive(Default)]
    struct LockCheckProvider {
        inner: StaticProvider,
        state: OnceLock<Arc<Mutex<RegistryState<LockCheckProvider>>>>,
        locked_calls: AtomicUsize,
    }

    impl LockCheckProvider {
        fn observe(&self) {
            if self.state.get().is_some_and(|state| state.try_lock().is_err()) {
                self.locked_calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn locked_calls(&self) -> usize {
            self.locked_calls.load(Ordering::SeqCst)
        }
    }

    impl Provider for LockCheckProvider {
        type Owner = StaticOwner;
        type Repository = StaticRepository;

        fn open_owner(&self, name: &str) -> std::result::Result<StaticOwner, ProviderError> {
            self.observe();
            self.inner.open_owner(name)
        }

        fn list_repositories(
            &self,
            owner: &StaticOwner,
        ) -> std::result::Result<Vec<String>, ProviderError> {
            self.observe();
            self.inner.list_repositories(owner)
        }

        fn open_repository(
            &self,
            owner: &StaticOwner,
            name: &str,
        ) -> std::result::Result<StaticRepository, ProviderError> {
            self.observe();
            self.inner.open_repository(owner, name)
        }
    }

    #[tokio::test]
    async fn test_provider_runs_without_lock() {
        let registry = Registry::new(LockCheckProvider {
            inner: StaticProvider::new().with_owner("billziss-gh", &["hubfs"]),
            ..Default::default()
        });
        let _ = registry
            .provider()
            .state
            .set(Arc::clone(registry.cache.state()));

        let owner = registry.open_owner("billziss-gh").await.unwrap();
        let repository = registry.open_repository(&owner, "hubfs").await.unwrap();
        assert_eq!(registry.repositories(&owner).await.unwrap(), vec!["hubfs"]);

        assert_eq!(registry.provider().inner.opened(), 2);
        assert_eq!(registry.provider().locked_calls(), 0);

        // A call made under the lock is noticed
        let guard = registry.cache.lock().await;
        registry.provider().observe();
        drop(guard);
        assert_eq!(registry.provider().locked_calls(), 1);

        registry.close_repository(repository).await.unwrap();
        registry.close_owner(owner).await.unwrap();
    }

    #[test]
    fn test_config_sets_sweep_interval() {
        let config = Config {
            ttl_secs: 5,
            sweep_interval_ms: 250,
        };
        let registry = Registry::with_config(StaticProvider::new(), config);

        assert_eq!(registry.cache.sweep_interval(), Duration::from_millis(250));
        assert_eq!(registry.config().ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_with_repositories_restores_table() {
        let (mut state, owner, repo, _) = state_with_repository();

        let found = state.with_repositories(owner, |repositories, _| repositories.get("hubfs"));

        assert_eq!(found, Some(Some(repo)));
        assert_eq!(state.repositories(owner).map(ExactMap::len), Some(1));
        assert!(state.with_repositories(repo, |_, _| ()).is_none());
    }

    #[test]
    fn test_reclaim_repository_releases_owner() {
        let (mut state, owner, repo, now) = state_with_repository();
        let expiry = Expiry::new(now + TTL, TTL);

        // Owner is still held by the repository
        assert!(!state.reclaim(owner, &expiry));
        assert!(state.reclaim(repo, &expiry));

        assert!(state.entries.get(repo).is_none());
        let entry = state.entries.get(owner).unwrap();
        assert_eq!(entry.refcount(), 0);
        assert_eq!(entry.deadline(), now + TTL + TTL);

        assert!(state.reclaim(owner, &expiry));
        assert!(state.owners.is_empty());
        assert_eq!(state.entries.stored(), 0);
    }

    #[test]
    fn test_reclaim_stale_handle() {
        let (mut state, _, repo, now) = state_with_repository();
        let expiry = Expiry::new(now, TTL);

        assert!(state.reclaim(repo, &expiry));
        assert!(!state.reclaim(repo, &expiry));
    }
}
