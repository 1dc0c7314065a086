use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use moka::ops::compute::{CompResult, Op};
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::cache_error::{CacheEntry, CacheError};
use crate::cache_key::CacheKey;
use crate::resource::FetchFuture;
use crate::utils::CallOnDrop;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// A successfully fetched value, together with its weight.
#[derive(Clone)]
pub(crate) struct Fetched {
    pub value: AnyValue,
    pub weight: u32,
}

type FetchResult = CacheEntry<Fetched>;
type FetchChannel = Shared<BoxFuture<'static, FetchResult>>;

/// An item saved in the in-memory [`Store`].
///
/// Entries are never modified, but replaced as a whole.
pub(crate) struct Entry {
    /// When this entry turns stale.
    expiry: Instant,
    /// The fetch result, as soon as the fetch finished.
    ///
    /// This is written by the fetch itself, so it is available even when nobody awaits
    /// the `channel`.
    result: Arc<OnceLock<FetchResult>>,
    /// The channel all the waiters of this fetch share.
    channel: FetchChannel,
    /// The value of the successful entry this one replaced, for waiters accepting stale values.
    fallback: Option<Fetched>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.result.get() {
            None => "in flight",
            Some(Ok(_)) => "ok",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Entry")
            .field("expiry", &self.expiry)
            .field("state", &state)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Entry {
    /// Spawns `fetch` on the runtime and creates an entry that shares its result.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the fetch
    /// on the runtime, even if nobody ends up awaiting its results.
    pub fn spawn<T>(
        runtime: &Handle,
        key: &CacheKey,
        expiry: Instant,
        fetch: FetchFuture<T>,
        weigher: fn(&T) -> u32,
        in_flight: &Arc<AtomicUsize>,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let result: Arc<OnceLock<FetchResult>> = Arc::new(OnceLock::new());

        in_flight.fetch_add(1, Ordering::Relaxed);
        // A fetch that panicked or got aborted never sets its result.
        let done_token = {
            let in_flight = Arc::clone(in_flight);
            let result = Arc::clone(&result);
            CallOnDrop::new(move || {
                result.get_or_init(|| Err(CacheError::InternalError));
                in_flight.fetch_sub(1, Ordering::Relaxed);
            })
        };

        let task = {
            let key = key.clone();
            let result = Arc::clone(&result);
            async move {
                let _done_token = done_token; // move into the future

                let fetched = fetch.await.map(|value| {
                    let weight = weigher(&value);
                    let value: AnyValue = Arc::new(value);
                    Fetched { value, weight }
                });

                match &fetched {
                    Ok(fetched) => {
                        tracing::trace!(%key, weight = fetched.weight, "Fetched resource");
                    }
                    Err(err) => {
                        metric!(
                            counter("caches.fetch.error") += 1,
                            "resource" => key.resource().as_str(),
                            "error" => err.metrics_tag(),
                        );
                        tracing::debug!(%key, error = %err, "Failed to fetch resource");
                    }
                }

                result.set(fetched.clone()).ok();
                sender.send(fetched).ok();
            }
        };
        runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        let channel = receiver
            .map(|received| received.unwrap_or(Err(CacheError::InternalError)))
            .boxed()
            .shared();

        Self {
            expiry,
            result,
            channel,
            fallback: None,
        }
    }

    /// Creates an entry for a fetch that failed before it could be started.
    pub fn failed(expiry: Instant, error: CacheError) -> Self {
        let result = Arc::new(OnceLock::from(Err(error.clone())));
        let channel = future::ready(Err(error)).boxed().shared();

        Self {
            expiry,
            result,
            channel,
            fallback: None,
        }
    }

    /// Keeps the value of the replaced entry around until this entry's fetch has finished.
    pub fn with_fallback(mut self, fallback: Option<Fetched>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback(&self) -> Option<&Fetched> {
        self.fallback.as_ref()
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// The completed fetch result, or `None` while the fetch is still in flight.
    pub fn peek(&self) -> Option<&FetchResult> {
        self.result.get()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.peek(), Some(Err(_)))
    }

    /// Entries that are still in flight are never expired, so they are not refetched while
    /// the first fetch is still running.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.peek().is_some() && now >= self.expiry
    }

    pub fn completed(&self) -> Option<&Fetched> {
        self.peek()?.as_ref().ok()
    }

    /// The weight of a successfully completed entry.
    pub fn weight(&self) -> Option<u32> {
        self.completed().map(|fetched| fetched.weight)
    }

    /// Waits for the fetch of this entry to finish.
    pub fn wait(&self) -> impl Future<Output = FetchResult> + Send + 'static {
        self.channel.clone()
    }
}

/// The concurrent mapping from [`CacheKey`] to [`Entry`].
///
/// All mutations go through per-key atomic operations, and entries are compared by identity,
/// not by value. There is no lock over the whole store.
pub(crate) struct Store {
    entries: moka::sync::Cache<CacheKey, Arc<Entry>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("entries", &self.len())
            .finish()
    }
}

impl Store {
    /// Creates an unbounded store. Expiration and eviction are handled by the cache itself.
    pub fn new(name: &str) -> Self {
        let entries = moka::sync::Cache::builder().name(name).build();
        Self { entries }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.entries.get(key)
    }

    /// Atomically decides on the entry of `key`.
    ///
    /// `decide` is invoked under the lock of this single key, and concurrent decisions for the
    /// same key are serialized.
    pub fn compute<F>(&self, key: &CacheKey, decide: F) -> CompResult<CacheKey, Arc<Entry>>
    where
        F: FnOnce(Option<Arc<Entry>>) -> Op<Arc<Entry>>,
    {
        self.entries
            .entry(key.clone())
            .and_compute_with(|current| decide(current.map(|current| current.into_value())))
    }

    /// Removes the entry of `key`, but only if it still is `entry`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove_if_unchanged(&self, key: &CacheKey, entry: &Arc<Entry>) -> bool {
        let result = self
            .entries
            .entry(key.clone())
            .and_compute_with(|current| match current {
                Some(current) if Arc::ptr_eq(current.value(), entry) => Op::Remove,
                _ => Op::Nop,
            });
        matches!(result, CompResult::Removed(_))
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes all entries whose key matches `predicate`, returning the number of removed entries.
    pub fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let mut removed = 0;
        for (key, _) in self.entries.iter() {
            if predicate(&key) && self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// A point-in-time copy of all the entries.
    pub fn snapshot(&self) -> Vec<(Arc<CacheKey>, Arc<Entry>)> {
        self.entries.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }
}
