use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use resource_cache::{
    CacheError, CachedResource, ConnectionSettings, DEFAULT_EXPIRY, Resource, ResourceCache,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct connections the requests are spread over.
    #[serde(default = "default_connections")]
    pub connections: usize,
    pub resources: Vec<SyntheticResource>,
}

fn default_connections() -> usize {
    1
}

/// A resource answered by a fake remote service.
#[derive(Debug, Deserialize, Serialize)]
pub struct SyntheticResource {
    pub id: String,
    /// How long a single fetch takes.
    #[serde(with = "humantime_serde", default)]
    pub latency: Duration,
    /// The share of fetches that fail, between `0.0` and `1.0`.
    #[serde(default)]
    pub failure_rate: f64,
    /// The number of items every fetch returns, which is also the weight of the cached value.
    #[serde(default = "default_items")]
    pub items: usize,
    #[serde(with = "humantime_serde", default)]
    pub expiry: Option<Duration>,
}

fn default_items() -> usize {
    1
}

/// A workload ready to be run against a cache.
pub struct ParsedWorkload {
    pub concurrency: usize,
    pub connections: Vec<ConnectionSettings>,
    pub resources: Vec<Resource<Vec<u32>>>,
    /// The number of fetches the synthetic services have seen.
    pub fetches: Arc<AtomicUsize>,
}

pub fn prepare_workload(index: usize, workload: Workload) -> Result<ParsedWorkload> {
    anyhow::ensure!(
        !workload.resources.is_empty(),
        "workload {index} has no resources"
    );
    let fetches = Arc::new(AtomicUsize::new(0));

    let connections = (0..workload.connections.max(1))
        .map(|i| ConnectionSettings::credentials("us-east-1", format!("workload-{index}:{i}")))
        .collect();

    let resources = workload
        .resources
        .into_iter()
        .map(|resource| synthetic_resource(resource, Arc::clone(&fetches)))
        .collect();

    Ok(ParsedWorkload {
        concurrency: workload.concurrency,
        connections,
        resources,
        fetches,
    })
}

fn synthetic_resource(
    resource: SyntheticResource,
    fetches: Arc<AtomicUsize>,
) -> Resource<Vec<u32>> {
    let SyntheticResource {
        id,
        latency,
        failure_rate,
        items,
        expiry,
    } = resource;

    CachedResource::new(id, move |_connection| {
        fetches.fetch_add(1, Ordering::Relaxed);
        let fails = rand::random::<f64>() < failure_rate;

        async move {
            tokio::time::sleep(latency).await;
            if fails {
                return Err(CacheError::FetchFailed("synthetic failure".into()));
            }
            Ok(vec![0; items])
        }
    })
    .with_expiry(expiry.unwrap_or(DEFAULT_EXPIRY))
    .into()
}

/// Requests a random resource of `workload` with a random connection.
pub async fn process_request(cache: &ResourceCache, workload: &ParsedWorkload) -> bool {
    let resource = &workload.resources[rand::random_range(0..workload.resources.len())];
    let connection = &workload.connections[rand::random_range(0..workload.connections.len())];

    cache.get(resource, connection).await.is_ok()
}
