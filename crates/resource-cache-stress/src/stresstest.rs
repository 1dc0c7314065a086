use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use resource_cache::{CacheConfig, ResourceCache};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_request};

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let cache = ResourceCache::new(cache_config, runtime);

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| prepare_workload(i, workload).map(Arc::new))
        .collect::<Result<Vec<_>>>()
        .context("invalid workloads")?;

    // warmup: request each workload once, so the stresstest starts with a warm cache
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_request(&cache, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let request_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failed_requests = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else {
                            break;
                        };
                        let cache = cache.clone();
                        let workload = Arc::clone(&workload);
                        let request_durations = Arc::clone(&request_durations);
                        let failed_requests = Arc::clone(&failed_requests);
                        let request_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            if !process_request(&cache, &workload).await {
                                failed_requests.fetch_add(1, Ordering::Relaxed);
                            }

                            if let Ok(mut durations) = request_durations.lock() {
                                durations.add(request_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let request_durations = request_durations
                .lock()
                .map(|mut durations| std::mem::take(&mut *durations))
                .unwrap_or_default();

            (request_durations, failed_requests.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (workload, task)) in workloads.iter().zip(finished_tasks).enumerate() {
        let (request_durations, failed) = task.context("workload panicked")?;
        let concurrency = workload.concurrency;

        let ops = request_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let quantile = |q| {
                let secs = request_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = Duration::from_secs_f64(request_durations.sum().unwrap_or_default() / ops as f64);
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        // every fetch not matched by a request was coalesced or served from the cache
        let fetches = workload.fetches.load(Ordering::Relaxed);
        let ratio = fetches as f64 / ops.max(1) as f64;
        println!("  fetches: {fetches} ({ratio:.4} per request); failed requests: {failed}");
    }

    let stats = cache.run_maintenance();
    println!();
    println!(
        "Cache: {} entries, weight {} (evicted {}, dropped {} failed)",
        cache.entry_count(),
        stats.weight_after,
        stats.evicted,
        stats.removed_failed,
    );

    cache.dispose();
    Ok(())
}
