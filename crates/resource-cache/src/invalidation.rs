use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::cache::ResourceCache;
use crate::connection::ProviderId;

/// A change of a credential or token provider that invalidates everything fetched with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationEvent {
    CredentialsRemoved(ProviderId),
    CredentialsModified(ProviderId),
    /// The scopes or the identity of a bearer token provider changed.
    TokenProviderChanged(ProviderId),
}

impl InvalidationEvent {
    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::CredentialsRemoved(id)
            | Self::CredentialsModified(id)
            | Self::TokenProviderChanged(id) => id,
        }
    }
}

impl ResourceCache {
    /// Drops every entry fetched with the provider of `event`.
    ///
    /// Returns the number of dropped entries.
    pub fn invalidate(&self, event: &InvalidationEvent) -> usize {
        let removed = self.clear_provider(event.provider_id());
        tracing::debug!(?event, removed, "Invalidated cached resources");
        removed
    }

    /// Applies all the events received on `events` until the cache is disposed or the channel
    /// is closed.
    ///
    /// A listener that lags behind has missed events, so it clears the whole cache.
    pub fn listen(&self, mut events: broadcast::Receiver<InvalidationEvent>) -> JoinHandle<()> {
        let cache = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        self.inner.runtime.spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => received,
                };

                let Some(cache) = ResourceCache::upgrade(&cache) else {
                    break;
                };
                match received {
                    Ok(event) => {
                        cache.invalidate(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed invalidation events, clearing the cache");
                        cache.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
