use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::cache::{Inner, ResourceCache};

/// The outcome of a single [`ResourceCache::run_maintenance`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Number of entries dropped because their fetch failed.
    pub removed_failed: usize,
    /// Number of successful entries evicted to get within the weight budget.
    pub evicted: usize,
    pub weight_before: u64,
    pub weight_after: u64,
}

impl ResourceCache {
    /// Drops failed entries, and evicts the entries expiring first until the cache is within
    /// its weight budget.
    ///
    /// Running fetches are neither weighed nor evicted. An entry that is replaced concurrently
    /// is left alone.
    pub fn run_maintenance(&self) -> MaintenanceStats {
        let mut stats = MaintenanceStats::default();
        if self.is_disposed() {
            return stats;
        }

        let store = &self.inner.store;
        let max_weight = self.inner.config.max_weight;

        let mut completed = Vec::new();
        for (key, entry) in store.snapshot() {
            if entry.is_failed() {
                if store.remove_if_unchanged(&key, &entry) {
                    stats.removed_failed += 1;
                }
            } else if let Some(weight) = entry.weight() {
                stats.weight_before += u64::from(weight);
                completed.push((key, entry));
            }
        }

        let mut weight = stats.weight_before;
        if weight > max_weight {
            completed.sort_by_key(|(_, entry)| entry.expiry());

            for (key, entry) in completed {
                if weight <= max_weight {
                    break;
                }
                if store.remove_if_unchanged(&key, &entry) {
                    weight -= u64::from(entry.weight().unwrap_or_default());
                    stats.evicted += 1;
                }
            }
        }
        stats.weight_after = weight;

        let cache = self.inner.config.name.as_str();
        metric!(counter("caches.maintenance.failed_removed") += stats.removed_failed as i64, "cache" => cache);
        metric!(counter("caches.maintenance.evicted") += stats.evicted as i64, "cache" => cache);
        metric!(gauge("caches.entries") = store.len() as u64, "cache" => cache);
        metric!(gauge("caches.weight") = stats.weight_after, "cache" => cache);

        tracing::debug!(
            cache,
            removed_failed = stats.removed_failed,
            evicted = stats.evicted,
            weight_before = stats.weight_before,
            weight_after = stats.weight_after,
            "Ran resource cache maintenance"
        );

        stats
    }
}

/// Periodically runs the maintenance of the cache behind `cache`.
///
/// The task stops once `shutdown` is cancelled or the cache is gone.
pub(crate) fn spawn_maintenance(
    runtime: &Handle,
    cache: Weak<Inner>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(cache) = ResourceCache::upgrade(&cache) else {
                break;
            };
            cache.run_maintenance();
        }
        tracing::debug!("Stopped resource cache maintenance");
    });
}
