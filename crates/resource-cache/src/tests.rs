use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use resource_cache_test::{self as test, FakeService};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use super::*;

fn cache_with(config: CacheConfig) -> ResourceCache {
    ResourceCache::new(config, Handle::current())
}

/// A cache without the periodic maintenance, so tests control when it runs.
fn cache() -> ResourceCache {
    cache_with(CacheConfig {
        maintenance_interval: None,
        ..Default::default()
    })
}

fn connection() -> ConnectionSettings {
    ConnectionSettings::credentials("us-east-1", "profile:default")
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn resource(id: &str, service: &FakeService<Vec<String>>) -> Resource<Vec<String>> {
    let service = service.clone();
    CachedResource::new(id, move |_connection| {
        let service = service.clone();
        async move { service.call().await.map_err(CacheError::FetchFailed) }
    })
    .into()
}

/// Lets the spawned background tasks catch up.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["a", "b"])).with_latency(Duration::from_secs(1));
    let buckets = resource("s3.buckets", &service);
    let connection = connection();

    let requests = (0..10).map(|_| cache.get(&buckets, &connection));
    let results = futures::future::join_all(requests).await;

    assert_eq!(service.calls(), 1);
    for result in results {
        assert_eq!(*result.unwrap(), names(&["a", "b"]));
    }
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.total_weight(), 2);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unexpired_entries_are_not_refetched() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["fn-a"]));
    let functions = resource("lambda.functions", &service);
    let connection = connection();

    cache.get(&functions, &connection).await.unwrap();
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    cache.get(&functions, &connection).await.unwrap();
    assert_eq!(service.calls(), 1);

    service.respond(names(&["fn-a", "fn-b"]));
    let forced = cache
        .get_with(&functions, &connection, GetOptions::force())
        .await
        .unwrap();
    assert_eq!(service.calls(), 2);
    assert_eq!(*forced, names(&["fn-a", "fn-b"]));

    // the forced fetch restarted the expiry
    tokio::time::advance(Duration::from_secs(9 * 60)).await;
    cache.get(&functions, &connection).await.unwrap();
    assert_eq!(service.calls(), 2);

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    cache.get(&functions, &connection).await.unwrap();
    assert_eq!(service.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_custom_expiry() {
    test::setup();

    let cache = cache();
    let (queues, service) = with_expiry("sqs.queues", 1, 30);
    let connection = connection();

    cache.get(&queues, &connection).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    cache.get(&queues, &connection).await.unwrap();

    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_fallback() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["old"]));
    let stacks = resource("cloudformation.stacks", &service);
    let connection = connection();

    cache.get(&stacks, &connection).await.unwrap();
    tokio::time::advance(DEFAULT_EXPIRY + Duration::from_secs(1)).await;

    service.fail("Throttling");
    let stale = cache.get(&stacks, &connection).await.unwrap();
    assert_eq!(*stale, names(&["old"]));
    assert_eq!(service.calls(), 2);

    // the failed refetch replaced the stale value, so there is nothing to fall back to anymore
    let err = cache.get(&stacks, &connection).await.unwrap_err();
    assert_eq!(err, CacheError::FetchFailed("Throttling".into()));
    assert_eq!(service.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_errors_propagate_without_stale() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["old"]));
    let stacks = resource("cloudformation.stacks", &service);
    let connection = connection();

    cache.get(&stacks, &connection).await.unwrap();
    tokio::time::advance(DEFAULT_EXPIRY + Duration::from_secs(1)).await;

    service.fail("Throttling");
    let result = cache
        .get_with(&stacks, &connection, GetOptions::no_stale())
        .await;
    assert_eq!(result, Err(CacheError::FetchFailed("Throttling".into())));
}

#[tokio::test(start_paused = true)]
async fn test_stale_fallback_for_all_waiters_of_a_refetch() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["old"])).with_latency(Duration::from_secs(1));
    let stacks = resource("cloudformation.stacks", &service);
    let connection = connection();

    cache.get(&stacks, &connection).await.unwrap();
    tokio::time::advance(DEFAULT_EXPIRY + Duration::from_secs(1)).await;
    service.fail("Throttling");

    let spawn_get = || {
        let cache = cache.clone();
        let stacks = stacks.clone();
        let connection = connection.clone();
        tokio::spawn(async move { cache.get(&stacks, &connection).await })
    };

    // the first request starts the refetch, the second one joins it
    let first = spawn_get();
    settle().await;
    let second = spawn_get();
    settle().await;

    let no_stale = cache
        .get_with(&stacks, &connection, GetOptions::no_stale())
        .await;
    assert_eq!(no_stale, Err(CacheError::FetchFailed("Throttling".into())));

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(*first, names(&["old"]));
    assert_eq!(*second, names(&["old"]));
    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_started_without_stale_still_keeps_fallback() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["old"])).with_latency(Duration::from_secs(1));
    let stacks = resource("cloudformation.stacks", &service);
    let connection = connection();

    cache.get(&stacks, &connection).await.unwrap();
    tokio::time::advance(DEFAULT_EXPIRY + Duration::from_secs(1)).await;
    service.fail("Throttling");

    let strict = {
        let cache = cache.clone();
        let stacks = stacks.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            cache
                .get_with(&stacks, &connection, GetOptions::no_stale())
                .await
        })
    };
    settle().await;

    let stale = cache.get(&stacks, &connection).await.unwrap();
    assert_eq!(*stale, names(&["old"]));
    assert_eq!(
        strict.await.unwrap(),
        Err(CacheError::FetchFailed("Throttling".into()))
    );
    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_forced_refetch_falls_back_to_unexpired_value() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["log-group"]));
    let groups = resource("logs.groups", &service);
    let connection = connection();

    cache.get(&groups, &connection).await.unwrap();

    service.fail("ServiceUnavailable");
    let value = cache
        .get_with(&groups, &connection, GetOptions::force())
        .await
        .unwrap();
    assert_eq!(*value, names(&["log-group"]));
    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_entries_are_refetched() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(Vec::new());
    service.fail("AccessDenied");
    let repositories = resource("ecr.repositories", &service);
    let connection = connection();

    assert!(cache.get(&repositories, &connection).await.is_err());

    service.respond(names(&["repo"]));
    let value = cache.get(&repositories, &connection).await.unwrap();
    assert_eq!(*value, names(&["repo"]));
    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_synchronous_initiation_failure() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["role"]));
    let has_client = Arc::new(AtomicBool::new(true));

    let roles: Resource<Vec<String>> = {
        let service = service.clone();
        let has_client = Arc::clone(&has_client);
        CachedResource::from_initiator("iam.roles", move |_connection: &ConnectionSettings| {
            if !has_client.load(Ordering::SeqCst) {
                return Err(CacheError::PermissionDenied("no client".into()));
            }
            let service = service.clone();
            Ok(async move { service.call().await.map_err(CacheError::FetchFailed) })
        })
        .into()
    };
    let connection = connection();

    cache.get(&roles, &connection).await.unwrap();
    tokio::time::advance(DEFAULT_EXPIRY + Duration::from_secs(1)).await;
    has_client.store(false, Ordering::SeqCst);

    // the stale entry is kept in place
    let stale = cache.get(&roles, &connection).await.unwrap();
    assert_eq!(*stale, names(&["role"]));
    assert!(cache.get_if_present(&roles, &connection, true).is_some());

    let result = cache
        .get_with(&roles, &connection, GetOptions::no_stale())
        .await;
    assert_eq!(
        result,
        Err(CacheError::PermissionDenied("no client".into()))
    );
    assert!(cache.get_if_present(&roles, &connection, true).is_none());
    assert_eq!(service.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_if_present() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["table"])).with_latency(Duration::from_secs(1));
    let tables = resource("dynamodb.tables", &service);
    let connection = connection();

    assert!(cache.get_if_present(&tables, &connection, true).is_none());
    assert_eq!(service.calls(), 0);
    assert_eq!(cache.entry_count(), 0);

    let pending = {
        let cache = cache.clone();
        let tables = tables.clone();
        let connection = connection.clone();
        tokio::spawn(async move { cache.get(&tables, &connection).await })
    };
    settle().await;
    // still running
    assert!(cache.get_if_present(&tables, &connection, true).is_none());
    pending.await.unwrap().unwrap();

    let present = cache.get_if_present(&tables, &connection, false).unwrap();
    assert_eq!(*present, names(&["table"]));

    tokio::time::advance(DEFAULT_EXPIRY).await;
    assert!(cache.get_if_present(&tables, &connection, false).is_none());
    assert!(cache.get_if_present(&tables, &connection, true).is_some());
    assert_eq!(service.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_with_timeout() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["slow"])).with_latency(Duration::from_secs(10));
    let clusters = resource("ecs.clusters", &service);
    let connection = connection();

    let timeout = Duration::from_secs(1);
    let result = cache
        .get_with_timeout(&clusters, &connection, GetOptions::default(), timeout)
        .await;
    assert_eq!(result, Err(CacheError::Timeout(timeout)));
    assert_eq!(cache.in_flight(), 1);

    // the fetch keeps running and gets cached
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(cache.in_flight(), 0);
    assert!(cache.get_if_present(&clusters, &connection, false).is_some());

    let value = cache
        .get_with_timeout(&clusters, &connection, GetOptions::default(), timeout)
        .await
        .unwrap();
    assert_eq!(*value, names(&["slow"]));
    assert_eq!(service.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear_connection_is_scoped() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["i-1"]));
    let instances = resource("ec2.instances", &service);

    let dev_east = ConnectionSettings::credentials("us-east-1", "profile:dev");
    let dev_west = ConnectionSettings::credentials("us-west-2", "profile:dev");
    let prod_east = ConnectionSettings::credentials("us-east-1", "profile:prod");

    for connection in [&dev_east, &dev_west, &prod_east] {
        cache.get(&instances, connection).await.unwrap();
    }
    assert_eq!(cache.entry_count(), 3);
    assert_eq!(service.calls(), 3);

    // a token connection with the same region and provider shares the scope
    let token_dev_east = ConnectionSettings::bearer_token("us-east-1", "profile:dev");
    assert_eq!(cache.clear_connection(&token_dev_east), 1);
    assert_eq!(cache.entry_count(), 2);

    cache.get(&instances, &dev_west).await.unwrap();
    cache.get(&instances, &prod_east).await.unwrap();
    assert_eq!(service.calls(), 3);

    cache.get(&instances, &dev_east).await.unwrap();
    assert_eq!(service.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_clear_resource() {
    test::setup();

    let cache = cache();
    let buckets_service = FakeService::new(names(&["bucket"]));
    let buckets = resource("s3.buckets", &buckets_service);
    let topics_service = FakeService::new(names(&["topic"]));
    let topics = resource("sns.topics", &topics_service);
    let connection = connection();

    cache.get(&buckets, &connection).await.unwrap();
    cache.get(&topics, &connection).await.unwrap();

    // clearing a view clears its underlying resource
    let first_bucket = buckets.find(|_| true);
    assert!(cache.clear_resource(&first_bucket, &connection));
    assert!(!cache.clear_resource(&buckets, &connection));
    assert_eq!(cache.entry_count(), 1);

    assert!(cache.get_if_present(&topics, &connection, false).is_some());
    assert_eq!(cache.clear(), 1);
    assert_eq!(cache.entry_count(), 0);
}

fn with_expiry(
    id: &str,
    items: usize,
    expiry: u64,
) -> (Resource<Vec<String>>, FakeService<Vec<String>>) {
    let service = FakeService::new(vec!["item".to_owned(); items]);
    let resource = match resource(id, &service) {
        Resource::Cached(resource) => resource.with_expiry(Duration::from_secs(expiry)).into(),
        Resource::View(_) => unreachable!(),
    };
    (resource, service)
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_evicts_earliest_expiry_first() {
    test::setup();

    let cache = cache_with(CacheConfig {
        maintenance_interval: None,
        max_weight: 10,
        ..Default::default()
    });
    let connection = connection();

    let (soon, _) = with_expiry("soon", 6, 60);
    let (later, _) = with_expiry("later", 6, 300);
    let (latest, _) = with_expiry("latest", 3, 600);
    let (broken, broken_service) = with_expiry("broken", 1, 600);
    broken_service.fail("InternalFailure");

    for resource in [&latest, &soon, &later] {
        cache.get(resource, &connection).await.unwrap();
    }
    assert!(cache.get(&broken, &connection).await.is_err());
    assert_eq!(cache.entry_count(), 4);
    assert_eq!(cache.total_weight(), 15);

    let stats = cache.run_maintenance();
    insta::assert_debug_snapshot!(stats, @r"
    MaintenanceStats {
        removed_failed: 1,
        evicted: 1,
        weight_before: 15,
        weight_after: 9,
    }
    ");

    assert!(cache.get_if_present(&soon, &connection, true).is_none());
    assert!(cache.get_if_present(&later, &connection, true).is_some());
    assert!(cache.get_if_present(&latest, &connection, true).is_some());
    assert!(cache.total_weight() <= 10);

    // within budget, nothing to do
    assert_eq!(
        cache.run_maintenance(),
        MaintenanceStats {
            weight_before: 9,
            weight_after: 9,
            ..Default::default()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_skips_running_fetches() {
    test::setup();

    let cache = cache_with(CacheConfig {
        maintenance_interval: None,
        max_weight: 0,
        ..Default::default()
    });
    let service = FakeService::new(names(&["a"])).with_latency(Duration::from_secs(5));
    let pipelines = resource("codepipeline.pipelines", &service);
    let connection = connection();

    let pending = {
        let cache = cache.clone();
        let pipelines = pipelines.clone();
        let connection = connection.clone();
        tokio::spawn(async move { cache.get(&pipelines, &connection).await })
    };
    settle().await;

    let stats = cache.run_maintenance();
    assert_eq!(stats.evicted, 0);
    assert_eq!(stats.weight_before, 0);
    assert_eq!(cache.entry_count(), 1);

    pending.await.unwrap().unwrap();
    assert_eq!(cache.run_maintenance().evicted, 1);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_maintenance() {
    test::setup();

    let cache = cache_with(CacheConfig {
        maintenance_interval: Some(Duration::from_secs(60)),
        ..Default::default()
    });
    let service = FakeService::new(Vec::new());
    service.fail("ExpiredToken");
    let keys = resource("kms.keys", &service);
    let connection = connection();

    assert!(cache.get(&keys, &connection).await.is_err());
    assert_eq!(cache.entry_count(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_views_reflect_invalidation() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["logs-dev", "assets", "logs-prod"]));
    let buckets = resource("s3.buckets", &service);
    let log_buckets = buckets.filter(|name| name.starts_with("logs-"));
    let prod_bucket = log_buckets.find(|name| name.ends_with("-prod"));
    let count = log_buckets.map(Vec::len);
    let connection = connection();

    let logs = cache.get(&log_buckets, &connection).await.unwrap();
    assert_eq!(*logs, names(&["logs-dev", "logs-prod"]));
    let prod = cache.get(&prod_bucket, &connection).await.unwrap();
    assert_eq!(prod.as_deref(), Some("logs-prod"));
    assert_eq!(*cache.get(&count, &connection).await.unwrap(), 2);
    assert_eq!(service.calls(), 1);

    service.respond(names(&["logs-staging"]));
    assert_eq!(*cache.get(&count, &connection).await.unwrap(), 2);

    let removed = cache.invalidate(&InvalidationEvent::CredentialsModified(ProviderId::new(
        "profile:default",
    )));
    assert_eq!(removed, 1);

    assert!(cache.get_if_present(&count, &connection, true).is_none());
    assert_eq!(*cache.get(&count, &connection).await.unwrap(), 1);
    let prod = cache.get(&prod_bucket, &connection).await.unwrap();
    assert_eq!(*prod, None);
    assert_eq!(service.calls(), 2);

    let present = cache.get_if_present(&log_buckets, &connection, false).unwrap();
    assert_eq!(*present, names(&["logs-staging"]));
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_by_provider() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["repo"]));
    let repositories = resource("codecommit.repositories", &service);

    let sso_east = ConnectionSettings::bearer_token("us-east-1", "sso:team");
    let sso_west = ConnectionSettings::bearer_token("eu-west-1", "sso:team");
    let profile = ConnectionSettings::credentials("us-east-1", "profile:default");

    for connection in [&sso_east, &sso_west, &profile] {
        cache.get(&repositories, connection).await.unwrap();
    }

    let removed = cache.invalidate(&InvalidationEvent::TokenProviderChanged(ProviderId::new(
        "sso:team",
    )));
    assert_eq!(removed, 2);
    assert!(cache.get_if_present(&repositories, &profile, false).is_some());

    let removed = cache.invalidate(&InvalidationEvent::CredentialsRemoved(ProviderId::new(
        "profile:default",
    )));
    assert_eq!(removed, 1);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_listener() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["function"]));
    let functions = resource("lambda.functions", &service);
    let default = connection();
    let other = ConnectionSettings::credentials("us-east-1", "profile:other");

    cache.get(&functions, &default).await.unwrap();
    cache.get(&functions, &other).await.unwrap();

    let (sender, receiver) = broadcast::channel(16);
    let listener = cache.listen(receiver);

    sender
        .send(InvalidationEvent::CredentialsRemoved(ProviderId::new(
            "profile:other",
        )))
        .unwrap();
    settle().await;

    assert_eq!(cache.entry_count(), 1);
    assert!(cache.get_if_present(&functions, &default, false).is_some());

    cache.dispose();
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lagging_listener_clears_everything() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["function"]));
    let functions = resource("lambda.functions", &service);
    let connection = connection();

    cache.get(&functions, &connection).await.unwrap();

    let (sender, receiver) = broadcast::channel(1);
    let listener = cache.listen(receiver);
    for i in 0..3 {
        sender
            .send(InvalidationEvent::CredentialsModified(ProviderId::new(
                format!("profile:unrelated-{i}"),
            )))
            .unwrap();
    }
    settle().await;
    assert_eq!(cache.entry_count(), 0);

    // closing the channel stops the listener
    drop(sender);
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dispose() {
    test::setup();

    let cache = cache();
    let service = FakeService::new(names(&["instance"]));
    let instances = resource("ec2.instances", &service);
    let connection = connection();

    cache.get(&instances, &connection).await.unwrap();
    cache.dispose();

    assert!(cache.is_disposed());
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(
        cache.get(&instances, &connection).await,
        Err(CacheError::Disposed)
    );
    assert!(cache.get_if_present(&instances, &connection, true).is_none());
    assert_eq!(cache.run_maintenance(), MaintenanceStats::default());

    // disposing twice is fine
    cache.dispose();
    assert_eq!(service.calls(), 1);
}

#[tokio::test]
async fn test_dispose_while_starting_a_fetch() {
    test::setup();

    let cache = cache();
    let connection = connection();

    // disposes the cache after the request checked for it, but before the entry is inserted
    let racing: Resource<Vec<String>> = {
        let cache = cache.clone();
        CachedResource::from_initiator("racing", move |_connection: &ConnectionSettings| {
            cache.inner.disposed.store(true, Ordering::SeqCst);
            Ok(async { Ok(Vec::new()) })
        })
        .into()
    };

    assert_eq!(
        cache.get(&racing, &connection).await,
        Err(CacheError::Disposed)
    );
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test]
async fn test_panicking_fetch() {
    test::setup();

    let cache = cache();
    let explode = Arc::new(AtomicBool::new(true));
    let crashing: Resource<Vec<String>> = {
        let explode = Arc::clone(&explode);
        CachedResource::new("crashing", move |_connection| {
            let explode = explode.load(Ordering::SeqCst);
            async move {
                if explode {
                    panic!("the service exploded");
                }
                Ok(Vec::new())
            }
        })
        .into()
    };
    let connection = connection();

    let result = cache.get(&crashing, &connection).await;
    assert_eq!(result, Err(CacheError::InternalError));
    assert_eq!(cache.in_flight(), 0);

    explode.store(false, Ordering::SeqCst);
    assert!(cache.get(&crashing, &connection).await.is_ok());
}

#[tokio::test]
async fn test_mismatching_types_for_one_id() {
    test::setup();

    let cache = cache();
    let connection = connection();
    let as_list: Resource<Vec<String>> =
        CachedResource::new("shared.id", |_connection| async { Ok(vec!["a".to_owned()]) }).into();
    let as_count: Resource<usize> =
        CachedResource::new("shared.id", |_connection| async { Ok(1) }).into();

    cache.get(&as_list, &connection).await.unwrap();
    assert_eq!(
        cache.get(&as_count, &connection).await,
        Err(CacheError::InternalError)
    );
    assert!(cache.get_if_present(&as_count, &connection, true).is_none());
}
