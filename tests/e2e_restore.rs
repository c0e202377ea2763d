//! Restart restore: persisted records come back as running tenants with
//! their counters, and dirty records are dropped.

use std::sync::Arc;

use sspool::app::restore_users;
use sspool::common::IpPolicy;
use sspool::dns::Resolver;
use sspool::filter::DomainFilter;
use sspool::proxy::ServerContext;
use sspool::registry::Registry;
use sspool::store::UserStore;

fn registry() -> Arc<Registry> {
    let filter = Arc::new(DomainFilter::new(Vec::new()));
    let policy = Arc::new(IpPolicy::new());
    let resolver = Arc::new(Resolver::new(filter.clone(), policy.clone()));
    Arc::new(Registry::new(Arc::new(ServerContext {
        resolver,
        filter,
        policy,
        hijack: None,
    })))
}

#[tokio::test]
async fn restore_brings_back_users_with_counters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.json");

    // First process life: persist a user, counters included.
    {
        let store = UserStore::open(&path).unwrap();
        store
            .put_config("u", "AES-256-GCM", "p", 18388)
            .unwrap();
        store.put_counters("u", 42, 17).unwrap();
    }

    // Second process life: restore from disk.
    let registry = registry();
    let store = Arc::new(UserStore::open(&path).unwrap());
    let report = restore_users(&registry, &store).await;
    assert_eq!(report.started, 1);
    assert_eq!(report.failed, 0);

    let snap = registry.snapshot().await;
    assert_eq!(snap["u"], (42, 17));

    let port = registry.get("u").await.unwrap().port();
    assert_eq!(port, 18388);
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("restored user must be listening");

    registry.shutdown_all().await;
}

#[tokio::test]
async fn restore_drops_records_that_cannot_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.json");

    {
        let store = UserStore::open(&path).unwrap();
        store.put_config("good", "AES-128-GCM", "p", 0).unwrap();
        store.put_config("bad", "no-such-cipher", "p", 0).unwrap();
    }

    let registry = registry();
    let store = Arc::new(UserStore::open(&path).unwrap());
    let report = restore_users(&registry, &store).await;
    assert_eq!(report.started, 1);
    assert_eq!(report.failed, 1);

    assert!(registry.exists("good").await);
    assert!(!registry.exists("bad").await);
    assert!(store.get("bad").is_none(), "dirty record is purged");

    registry.shutdown_all().await;
}

#[tokio::test]
async fn missing_counters_restore_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.json");
    std::fs::write(
        &path,
        r#"{"u":{"cipher":"AES-128-GCM","password":"p","port":0}}"#,
    )
    .unwrap();

    let registry = registry();
    let store = Arc::new(UserStore::open(&path).unwrap());
    restore_users(&registry, &store).await;

    let snap = registry.snapshot().await;
    assert_eq!(snap["u"], (0, 0));
    registry.shutdown_all().await;
}
