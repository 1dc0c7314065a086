use std::fs;
use std::time::Duration;

use resource_cache::config::Config;
use resource_cache::{CachedResource, ConnectionSettings, Resource, ResourceCache};
use resource_cache_test as test;

#[tokio::test]
async fn test_cache_from_config_file() {
    test::setup();

    let dir = test::tempdir();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
logging:
  level: debug
cache:
  name: explorer
  maintenance_interval: 2m
  max_weight: 2
"#,
    )
    .unwrap();

    let config = Config::get(Some(path.as_path())).unwrap();
    assert_eq!(config.cache.name, "explorer");
    assert_eq!(
        config.cache.maintenance_interval,
        Some(Duration::from_secs(120))
    );

    let cache = ResourceCache::new(config.cache, tokio::runtime::Handle::current());
    let connection = ConnectionSettings::credentials("eu-central-1", "profile:default");
    let topics: Resource<Vec<u32>> =
        CachedResource::new("sns.topics", |_connection| async { Ok(vec![1, 2, 3]) }).into();

    cache.get(&topics, &connection).await.unwrap();
    let stats = cache.run_maintenance();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.weight_after, 0);
}

#[::core::prelude::v1::test]
fn test_missing_config_file() {
    let dir = test::tempdir();
    let result = Config::get(Some(dir.path().join("missing.yml").as_path()));
    assert!(result.is_err());
}
