//! # Resource Cache
//!
//! An async, per-connection cache of expensive remote lookups, like listing the buckets or the
//! functions of an account. Every lookup is described by a [`Resource`] and scoped to a
//! [`ConnectionSettings`], which is the region and the credential (or token) provider the
//! lookup is done with.
//!
//! ## Fetching
//!
//! A [`CachedResource`] is cached under its [`CacheKey`] for its expiry, which defaults to
//! [`DEFAULT_EXPIRY`]. Requesting it goes through a per-key atomic decision:
//!
//! - Missing entries and entries whose fetch failed are fetched.
//! - Unexpired entries are returned as-is, unless a refetch is forced. Fetches that are still
//!   running count as unexpired, so concurrent requests share a single fetch.
//! - Expired entries are refetched. With [`GetOptions::use_stale`], a refetch that fails returns
//!   the previous value instead of the error.
//!
//! Fetches run on the tokio runtime the cache was created with, and keep running even if all
//! the requests waiting for them go away.
//!
//! A [`ViewResource`] derives its value from another resource with a cheap transform, created
//! with [`Resource::map`], [`Resource::filter`] or [`Resource::find`]. Views are not cached
//! themselves, they resolve their underlying resource through the cache on every access.
//!
//! ## Eviction and Invalidation
//!
//! Every value has a weight (see [`Weigh`]). The periodic maintenance drops failed entries and
//! then evicts the entries expiring first until the cache is within
//! [`CacheConfig::max_weight`].
//!
//! Entries are dropped explicitly with the `clear*` methods of [`ResourceCache`], and when
//! their provider changes, see [`InvalidationEvent`].
//!
//! ### Metrics
//!
//! All metrics are tagged with the `resource` or the `cache` they belong to:
//!
//! - `caches.access`: All accesses of cached resources.
//! - `caches.memory.hit`: Accesses served by an unexpired or still running entry.
//! - `caches.fetch`: Fetches being started.
//! - `caches.fetch.error`: Fetches that failed.
//! - `caches.fetch.sync_error`: Fetches that failed before they could be started.
//! - `caches.stale_fallback`: Failed refetches answered with the previous value.
//! - `caches.maintenance.failed_removed` and `caches.maintenance.evicted`: Entries dropped by
//!   the maintenance.
//! - `caches.entries` and `caches.weight`: Gauges reported after every maintenance.

#[macro_use]
pub mod metrics;

mod cache;
mod cache_error;
mod cache_key;
pub mod config;
mod connection;
mod invalidation;
pub mod logging;
mod maintenance;
mod memory;
mod resource;
mod utils;

#[cfg(test)]
mod tests;

pub use cache::{GetOptions, ResourceCache};
pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::CacheKey;
pub use config::CacheConfig;
pub use connection::{ConnectionSettings, ProviderId, Region};
pub use invalidation::InvalidationEvent;
pub use maintenance::MaintenanceStats;
pub use resource::{CachedResource, DEFAULT_EXPIRY, Resource, ResourceId, ViewResource, Weigh};
