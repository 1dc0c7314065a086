//! Exercises the cache the way a resource explorer uses it: many concurrent lookups of a few
//! listings, narrowed down with views, across several connections.

use std::time::Duration;

use resource_cache::{
    CacheConfig, CacheError, CachedResource, ConnectionSettings, GetOptions, InvalidationEvent,
    ProviderId, Resource, ResourceCache,
};
use resource_cache_test::{self as test, FakeService};

#[derive(Clone, Debug, PartialEq)]
struct Function {
    name: String,
    runtime: &'static str,
}

fn function(name: &str, runtime: &'static str) -> Function {
    Function {
        name: name.to_owned(),
        runtime,
    }
}

fn functions(service: &FakeService<Vec<Function>>) -> Resource<Vec<Function>> {
    let service = service.clone();
    CachedResource::new("lambda.functions", move |connection: ConnectionSettings| {
        let service = service.clone();
        async move {
            tracing::debug!(%connection, "Listing functions");
            service.call().await.map_err(CacheError::FetchFailed)
        }
    })
    .into()
}

fn new_cache() -> ResourceCache {
    let config = CacheConfig {
        maintenance_interval: None,
        ..Default::default()
    };
    ResourceCache::new(config, tokio::runtime::Handle::current())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_across_threads() {
    test::setup();

    let cache = new_cache();
    let service = FakeService::new(vec![
        function("resize-images", "python3.12"),
        function("send-emails", "nodejs20.x"),
    ])
    .with_latency(Duration::from_millis(50));
    let functions = functions(&service);
    let python = functions.filter(|function| function.runtime.starts_with("python"));
    let connection = ConnectionSettings::credentials("us-west-2", "profile:default");

    let lookups: Vec<_> = (0..32)
        .map(|i| {
            let cache = cache.clone();
            let functions = functions.clone();
            let python = python.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    cache.get(&functions, &connection).await.map(|all| all.len())
                } else {
                    cache.get(&python, &connection).await.map(|python| python.len())
                }
            })
        })
        .collect();

    for (i, lookup) in lookups.into_iter().enumerate() {
        let len = lookup.await.unwrap().unwrap();
        assert_eq!(len, if i % 2 == 0 { 2 } else { 1 });
    }
    assert_eq!(service.calls(), 1);
}

#[tokio::test]
async fn test_views_per_connection() {
    test::setup();

    let cache = new_cache();
    let service = FakeService::new(vec![function("api", "java21")]);
    let functions = functions(&service);
    let api = functions.find(|function| function.name == "api");
    let names = functions.map(|functions| {
        functions
            .iter()
            .map(|function| function.name.clone())
            .collect::<Vec<_>>()
    });

    let sso = ConnectionSettings::bearer_token("us-east-1", "sso:developer");
    let profile = ConnectionSettings::credentials("us-east-1", "profile:ci");

    let found = cache.get(&api, &sso).await.unwrap();
    assert_eq!(*found, Some(function("api", "java21")));
    assert_eq!(*cache.get(&names, &profile).await.unwrap(), vec!["api"]);
    assert_eq!(service.calls(), 2);

    // a token provider changing its scopes only drops what was fetched with it
    service.respond(Vec::new());
    cache.invalidate(&InvalidationEvent::TokenProviderChanged(ProviderId::new(
        "sso:developer",
    )));

    assert_eq!(*cache.get(&api, &sso).await.unwrap(), None);
    assert_eq!(*cache.get(&names, &profile).await.unwrap(), vec!["api"]);
    assert_eq!(service.calls(), 3);

    let fresh = cache
        .get_with(&names, &profile, GetOptions::force())
        .await
        .unwrap();
    assert!(fresh.is_empty());
    assert_eq!(service.calls(), 4);
}

#[tokio::test]
async fn test_dropping_the_cache_stops_the_listener() {
    test::setup();

    let cache = new_cache();
    let (_sender, receiver) = tokio::sync::broadcast::channel(4);
    let listener = cache.listen(receiver);

    drop(cache);
    listener.await.unwrap();
}
