use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource.
///
/// This error is shared between all the waiters of a single fetch, and is kept in the cache
/// until the entry is replaced or cleaned up by maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource does not exist for the requested connection.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote service's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource was not fetched in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, throttling, or a 5xx service response.
    ///
    /// The attached string contains the remote service's response.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// The resource was fetched successfully, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The cache has been disposed and does not serve any more requests.
    #[error("cache disposed")]
    Disposed,
    /// An unexpected error in the cache itself.
    ///
    /// This includes fetches that panicked or got aborted, and resource ids that are shared by
    /// descriptors of different value types.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Logs the given error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable tag used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::NotFound => "notfound",
            CacheError::PermissionDenied(_) => "permissiondenied",
            CacheError::Timeout(_) => "timeout",
            CacheError::FetchFailed(_) => "fetchfailed",
            CacheError::Malformed(_) => "malformed",
            CacheError::Disposed => "disposed",
            CacheError::InternalError => "internal",
        }
    }
}

/// The result of a resource fetch, containing either `Ok(T)` or an error denoting the reason
/// why a resource could not be fetched or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
