use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::cache::{GetOptions, ResourceCache};
use crate::cache_error::CacheEntry;
use crate::connection::ConnectionSettings;

/// The time a freshly fetched resource stays valid, unless overridden per resource.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// The stable identifier of a [`CachedResource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The "cost" of keeping a value in the cache.
///
/// Collections weigh their number of items, everything else weighs `1` by default.
/// The weight is only used to decide when and what to evict, never for correctness.
pub trait Weigh {
    fn weight(&self) -> u32 {
        1
    }
}

fn len_weight(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

macro_rules! impl_len_weigh {
    ($($ty:ty => [$($gen:tt)*]),* $(,)?) => {
        $(
            impl<$($gen)*> Weigh for $ty {
                fn weight(&self) -> u32 {
                    len_weight(self.len())
                }
            }
        )*
    };
}

impl_len_weigh! {
    Vec<T> => [T],
    VecDeque<T> => [T],
    Box<[T]> => [T],
    Arc<[T]> => [T],
    HashMap<K, V, S> => [K, V, S],
    HashSet<T, S> => [T, S],
    BTreeMap<K, V> => [K, V],
    BTreeSet<T> => [T],
}

macro_rules! impl_unit_weigh {
    ($($ty:ty),* $(,)?) => {
        $(impl Weigh for $ty {})*
    };
}

impl_unit_weigh!(
    (),
    bool,
    String,
    &'static str,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize
);

impl<T> Weigh for Option<T> {}

pub(crate) type FetchFuture<T> = BoxFuture<'static, CacheEntry<T>>;

type FetchFn<T> = dyn Fn(&ConnectionSettings) -> CacheEntry<FetchFuture<T>> + Send + Sync;

/// A resource that is fetched with a connection and cached for a period of time.
pub struct CachedResource<T> {
    id: ResourceId,
    expiry: Duration,
    fetch: Arc<FetchFn<T>>,
    weigher: fn(&T) -> u32,
}

impl<T> Clone for CachedResource<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            expiry: self.expiry,
            fetch: Arc::clone(&self.fetch),
            weigher: self.weigher,
        }
    }
}

impl<T> fmt::Debug for CachedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResource")
            .field("id", &self.id)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl<T: Weigh + Send + Sync + 'static> CachedResource<T> {
    /// Creates a resource from an async fetch function.
    pub fn new<F, Fut>(id: impl AsRef<str>, fetch: F) -> Self
    where
        F: Fn(ConnectionSettings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        Self::from_initiator(id, move |connection: &ConnectionSettings| {
            Ok(fetch(connection.clone()))
        })
    }

    /// Creates a resource whose fetch can fail before it even started.
    ///
    /// This is the case when the connection is unusable, for example because no client can be
    /// created for it. Such failures are treated differently from a failing fetch: when stale
    /// values are allowed, the previous value is kept in the cache.
    pub fn from_initiator<F, Fut>(id: impl AsRef<str>, initiate: F) -> Self
    where
        F: Fn(&ConnectionSettings) -> CacheEntry<Fut> + Send + Sync + 'static,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let fetch = move |connection: &ConnectionSettings| {
            initiate(connection).map(|fut| fut.boxed())
        };
        Self {
            id: ResourceId::new(id),
            expiry: DEFAULT_EXPIRY,
            fetch: Arc::new(fetch),
            weigher: T::weight,
        }
    }
}

impl<T> CachedResource<T> {
    /// Overrides the default expiry of [10 minutes](DEFAULT_EXPIRY).
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub(crate) fn initiate(&self, connection: &ConnectionSettings) -> CacheEntry<FetchFuture<T>> {
        (self.fetch)(connection)
    }

    pub(crate) fn weigher(&self) -> fn(&T) -> u32 {
        self.weigher
    }
}

/// Resolves a view by going through the cache for its underlying resource.
pub(crate) trait View<T>: Send + Sync {
    fn cached_id(&self) -> &ResourceId;

    fn resolve<'a>(
        &'a self,
        cache: &'a ResourceCache,
        connection: &'a ConnectionSettings,
        options: GetOptions,
    ) -> BoxFuture<'a, CacheEntry<Arc<T>>>;

    fn resolve_if_present(
        &self,
        cache: &ResourceCache,
        connection: &ConnectionSettings,
        use_stale: bool,
    ) -> Option<Arc<T>>;
}

struct Transformed<I, T> {
    underlying: Resource<I>,
    transform: Arc<dyn Fn(&I) -> T + Send + Sync>,
}

impl<I, T> View<T> for Transformed<I, T>
where
    I: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn cached_id(&self) -> &ResourceId {
        self.underlying.cached_id()
    }

    fn resolve<'a>(
        &'a self,
        cache: &'a ResourceCache,
        connection: &'a ConnectionSettings,
        options: GetOptions,
    ) -> BoxFuture<'a, CacheEntry<Arc<T>>> {
        Box::pin(async move {
            let value = cache.get_with(&self.underlying, connection, options).await?;
            Ok(Arc::new((self.transform)(&value)))
        })
    }

    fn resolve_if_present(
        &self,
        cache: &ResourceCache,
        connection: &ConnectionSettings,
        use_stale: bool,
    ) -> Option<Arc<T>> {
        let value = cache.get_if_present(&self.underlying, connection, use_stale)?;
        Some(Arc::new((self.transform)(&value)))
    }
}

/// A resource derived from another resource by a transform.
///
/// Views are never cached themselves. Every access goes through the cache for the underlying
/// resource and then re-runs the transform, so transforms should be cheap and free of side
/// effects.
pub struct ViewResource<T> {
    view: Arc<dyn View<T>>,
}

impl<T> Clone for ViewResource<T> {
    fn clone(&self) -> Self {
        Self {
            view: Arc::clone(&self.view),
        }
    }
}

impl<T> ViewResource<T> {
    pub(crate) fn view(&self) -> &dyn View<T> {
        &*self.view
    }
}

/// Describes a fetchable value, either cached directly or derived from another resource.
pub enum Resource<T> {
    Cached(CachedResource<T>),
    View(ViewResource<T>),
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Cached(resource) => Self::Cached(resource.clone()),
            Self::View(view) => Self::View(view.clone()),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached(resource) => resource.fmt(f),
            Self::View(view) => f
                .debug_struct("ViewResource")
                .field("underlying", view.view.cached_id())
                .finish_non_exhaustive(),
        }
    }
}

impl<T> From<CachedResource<T>> for Resource<T> {
    fn from(resource: CachedResource<T>) -> Self {
        Self::Cached(resource)
    }
}

impl<T> Resource<T> {
    /// The id of the cached resource at the bottom of any view wrapping.
    pub fn cached_id(&self) -> &ResourceId {
        match self {
            Self::Cached(resource) => resource.id(),
            Self::View(view) => view.view.cached_id(),
        }
    }
}

impl<T: Send + Sync + 'static> Resource<T> {
    /// Creates a view applying `transform` to every resolved value.
    pub fn map<U, F>(&self, transform: F) -> Resource<U>
    where
        U: Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        Resource::View(ViewResource {
            view: Arc::new(Transformed {
                underlying: self.clone(),
                transform: Arc::new(transform),
            }),
        })
    }
}

impl<E: Clone + Send + Sync + 'static> Resource<Vec<E>> {
    /// Creates a view only keeping the items matching `predicate`.
    pub fn filter<P>(&self, predicate: P) -> Resource<Vec<E>>
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.map(move |items| items.iter().filter(|item| predicate(item)).cloned().collect())
    }

    /// Creates a view resolving to the first item matching `predicate`.
    pub fn find<P>(&self, predicate: P) -> Resource<Option<E>>
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.map(move |items| items.iter().find(|item| predicate(item)).cloned())
    }
}
