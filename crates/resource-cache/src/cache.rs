use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache_error::{CacheEntry, CacheError};
use crate::cache_key::CacheKey;
use crate::config::CacheConfig;
use crate::connection::{ConnectionSettings, ProviderId};
use crate::maintenance;
use crate::memory::{AnyValue, Entry, Store};
use crate::resource::{CachedResource, Resource};

/// Controls how [`ResourceCache::get_with`] treats existing entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetOptions {
    /// Return the previously fetched value when a refetch fails.
    pub use_stale: bool,
    /// Refetch even if the cached value has not yet expired.
    pub force_fetch: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            use_stale: true,
            force_fetch: false,
        }
    }
}

impl GetOptions {
    /// Refetch unconditionally, falling back to the previous value on failure.
    pub fn force() -> Self {
        Self {
            force_fetch: true,
            ..Default::default()
        }
    }

    /// Never return a value that is expired or was fetched before a failing refetch.
    pub fn no_stale() -> Self {
        Self {
            use_stale: false,
            ..Default::default()
        }
    }
}

pub(crate) struct Inner {
    pub config: CacheConfig,
    pub runtime: Handle,
    pub store: Store,
    /// Number of fetches currently running, including abandoned ones.
    pub in_flight: Arc<AtomicUsize>,
    pub disposed: AtomicBool,
    /// Stops the maintenance timer and all the invalidation listeners.
    pub shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An async, per-connection cache of [`Resource`]s.
///
/// This is a cheap handle, clones share the same underlying cache.
///
/// Concurrent requests for the same resource and connection are coalesced: only a single fetch
/// runs at a time, and all its waiters share its result.
#[derive(Clone)]
pub struct ResourceCache {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.store.len())
            .field("running fetches", &self.in_flight())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ResourceCache {
    /// Creates a new cache spawning its fetches and its maintenance on `runtime`.
    pub fn new(config: CacheConfig, runtime: Handle) -> Self {
        let inner = Arc::new(Inner {
            store: Store::new(&config.name),
            config,
            runtime,
            in_flight: Default::default(),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        if let Some(interval) = inner.config.maintenance_interval {
            maintenance::spawn_maintenance(
                &inner.runtime,
                Arc::downgrade(&inner),
                interval,
                inner.shutdown.clone(),
            );
        }

        Self { inner }
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        let inner = inner.upgrade()?;
        Some(Self { inner })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Resolves `resource` for `connection`, allowing stale values on refetch failures.
    pub async fn get<T>(
        &self,
        resource: &Resource<T>,
        connection: &ConnectionSettings,
    ) -> CacheEntry<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_with(resource, connection, GetOptions::default())
            .await
    }

    /// Resolves `resource` for `connection`.
    ///
    /// Views resolve their underlying resource with the same `options`, and then apply their
    /// transform to it.
    pub async fn get_with<T>(
        &self,
        resource: &Resource<T>,
        connection: &ConnectionSettings,
        options: GetOptions,
    ) -> CacheEntry<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match resource {
            Resource::Cached(resource) => self.get_cached(resource, connection, options).await,
            Resource::View(view) => view.view().resolve(self, connection, options).await,
        }
    }

    /// Like [`get_with`](Self::get_with), but gives up waiting after `timeout`.
    ///
    /// The fetch itself is not cancelled. It keeps running in the background and its result is
    /// cached as usual.
    pub async fn get_with_timeout<T>(
        &self,
        resource: &Resource<T>,
        connection: &ConnectionSettings,
        options: GetOptions,
        timeout: Duration,
    ) -> CacheEntry<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        tokio::time::timeout(timeout, self.get_with(resource, connection, options))
            .await
            .map_err(|_| CacheError::Timeout(timeout))?
    }

    /// Returns the cached value if it is already available, without ever fetching it.
    ///
    /// Expired values are only returned with `use_stale`. Fetches that are still running or
    /// that failed count as absent.
    pub fn get_if_present<T>(
        &self,
        resource: &Resource<T>,
        connection: &ConnectionSettings,
        use_stale: bool,
    ) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match resource {
            Resource::Cached(resource) => self.peek_cached(resource, connection, use_stale),
            Resource::View(view) => view
                .view()
                .resolve_if_present(self, connection, use_stale),
        }
    }

    async fn get_cached<T>(
        &self,
        resource: &CachedResource<T>,
        connection: &ConnectionSettings,
        options: GetOptions,
    ) -> CacheEntry<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }

        let key = CacheKey::new(resource.id().clone(), connection);
        metric!(counter("caches.access") += 1, "resource" => key.resource().as_str());

        let entry = self.decide(resource, connection, &key, options)?;

        match entry.wait().await {
            Ok(fetched) => downcast(&key, fetched.value),
            Err(err) => {
                let stale = entry.fallback().filter(|_| options.use_stale);

                match stale {
                    Some(stale) => {
                        metric!(
                            counter("caches.stale_fallback") += 1,
                            "resource" => key.resource().as_str(),
                            "error" => err.metrics_tag(),
                        );
                        tracing::warn!(%key, error = %err, "Refetch failed, using stale value");
                        downcast(&key, stale.value.clone())
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Atomically decides which entry serves the request for `key`.
    ///
    /// An entry replacing a successfully fetched one carries the previous value as its
    /// fallback, so every waiter of the refetch can fall back to it.
    fn decide<T>(
        &self,
        resource: &CachedResource<T>,
        connection: &ConnectionSettings,
        key: &CacheKey,
        options: GetOptions,
    ) -> CacheEntry<Arc<Entry>>
    where
        T: Send + Sync + 'static,
    {
        let now = Instant::now();
        let expiry = now + resource.expiry();
        let mut disposed = false;

        let start_fetch = || -> CacheEntry<Entry> {
            let fetch = resource.initiate(connection).inspect_err(|err| {
                metric!(
                    counter("caches.fetch.sync_error") += 1,
                    "resource" => key.resource().as_str(),
                    "error" => err.metrics_tag(),
                );
            })?;
            metric!(counter("caches.fetch") += 1, "resource" => key.resource().as_str());
            Ok(Entry::spawn(
                &self.inner.runtime,
                key,
                expiry,
                fetch,
                resource.weigher(),
                &self.inner.in_flight,
            ))
        };

        let result = self.inner.store.compute(key, |current| {
            // `dispose` may have cleared the store since the caller checked
            if self.is_disposed() {
                disposed = true;
                return Op::Nop;
            }

            match current {
                Some(current)
                    if !current.is_failed() && !current.is_expired(now) && !options.force_fetch =>
                {
                    metric!(counter("caches.memory.hit") += 1, "resource" => key.resource().as_str());
                    Op::Nop
                }
                Some(current) if !current.is_failed() && options.use_stale => match start_fetch() {
                    Ok(entry) => {
                        tracing::debug!(%key, "Refetching resource");
                        let entry = entry.with_fallback(current.completed().cloned());
                        Op::Put(Arc::new(entry))
                    }
                    Err(err) => {
                        tracing::warn!(%key, error = %err, "Failed to start refetch, keeping stale value");
                        Op::Nop
                    }
                },
                current => {
                    tracing::debug!(%key, "Fetching resource");
                    let fallback = current.as_deref().and_then(Entry::completed).cloned();
                    let entry = start_fetch().unwrap_or_else(|err| Entry::failed(expiry, err));
                    Op::Put(Arc::new(entry.with_fallback(fallback)))
                }
            }
        });
        if disposed {
            return Err(CacheError::Disposed);
        }

        let entry = match result {
            CompResult::Inserted(entry)
            | CompResult::ReplacedWith(entry)
            | CompResult::Unchanged(entry) => entry.into_value(),
            CompResult::Removed(_) | CompResult::StillNone(_) => {
                tracing::error!(%key, "Cache entry vanished while deciding on it");
                return Err(CacheError::InternalError);
            }
        };

        // a concurrent `dispose` may have cleared the store right before the insert
        if self.is_disposed() {
            self.inner.store.remove_if_unchanged(key, &entry);
            return Err(CacheError::Disposed);
        }

        Ok(entry)
    }

    fn peek_cached<T>(
        &self,
        resource: &CachedResource<T>,
        connection: &ConnectionSettings,
        use_stale: bool,
    ) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        if self.is_disposed() {
            return None;
        }

        let key = CacheKey::new(resource.id().clone(), connection);
        let entry = self.inner.store.get(&key)?;
        if !use_stale && entry.is_expired(Instant::now()) {
            return None;
        }
        let fetched = entry.completed()?;
        downcast(&key, fetched.value.clone()).ok()
    }

    /// Removes the entry of `resource` for `connection`.
    ///
    /// Views clear their underlying cached resource.
    pub fn clear_resource<T>(&self, resource: &Resource<T>, connection: &ConnectionSettings) -> bool {
        let key = CacheKey::new(resource.cached_id().clone(), connection);
        self.inner.store.remove(&key)
    }

    /// Removes all the entries fetched with the region and provider of `connection`.
    pub fn clear_connection(&self, connection: &ConnectionSettings) -> usize {
        self.inner
            .store
            .remove_where(|key| key.matches_connection(connection))
    }

    /// Removes all the entries fetched with `provider`, in any region.
    pub fn clear_provider(&self, provider: &ProviderId) -> usize {
        self.inner
            .store
            .remove_where(|key| key.provider() == provider)
    }

    pub fn clear(&self) -> usize {
        self.inner.store.clear()
    }

    /// Shuts down the cache.
    ///
    /// Stops the maintenance and all invalidation listeners and drops every entry. Running
    /// fetches are abandoned, not cancelled. Afterwards, every request fails with
    /// [`CacheError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let removed = self.inner.store.clear();
        tracing::debug!(cache = %self.inner.config.name, removed, "Disposed resource cache");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.store.len()
    }

    /// The summed up weight of all the successfully fetched entries.
    pub fn total_weight(&self) -> u64 {
        self.inner
            .store
            .snapshot()
            .iter()
            .filter_map(|(_, entry)| entry.weight())
            .map(u64::from)
            .sum()
    }

    /// The number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }
}

fn downcast<T>(key: &CacheKey, value: AnyValue) -> CacheEntry<Arc<T>>
where
    T: Send + Sync + 'static,
{
    value.downcast::<T>().map_err(|_| {
        tracing::error!(
            %key,
            expected = std::any::type_name::<T>(),
            "Cached value has an unexpected type"
        );
        CacheError::InternalError
    })
}
