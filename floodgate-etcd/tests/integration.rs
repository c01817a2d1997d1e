#![cfg(feature = "etcd-client")]

use floodgate::store::{Fields, LimitStore};
use floodgate_etcd::EtcdLimitStore;
use std::time::Duration;

// Requires etcd running. If FLOODGATE_TEST_ETCD_ENDPOINT is unset, the test skips.
#[tokio::test]
async fn limits_round_trip_through_etcd() {
    let endpoint = match std::env::var("FLOODGATE_TEST_ETCD_ENDPOINT") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set FLOODGATE_TEST_ETCD_ENDPOINT (e.g. http://127.0.0.1:2379)");
            return;
        }
    };
    let mut client = etcd_client::Client::connect([endpoint.as_str()], None)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to etcd at '{}': {}", endpoint, e));

    let namespace = format!("floodgate_test/{}", uuid::Uuid::new_v4());
    let store = EtcdLimitStore::new(namespace.clone(), client.clone()).expect("valid store");

    store.ensure_exists("ratelimits").await.expect("ensure_exists");
    store.ensure_exists("ratelimits").await.expect("ensure_exists is idempotent");
    assert!(store.bulk_read("ratelimits").await.expect("read").is_empty(), "marker is not a field");

    let fields = Fields::from([("/a".to_string(), "7".to_string()), ("/b".to_string(), "12".to_string())]);
    store.bulk_write("ratelimits", fields.clone(), Some(Duration::from_secs(60))).await.expect("write");
    assert_eq!(store.bulk_read("ratelimits").await.expect("read"), fields);

    let entry = Fields::from([("new_limit".to_string(), "6".to_string())]);
    store.append("ratelimit_log_/a", entry).await.expect("append");
    let resp = client
        .get(format!("{namespace}/ratelimit_log_/a/"), Some(etcd_client::GetOptions::new().with_prefix()))
        .await
        .expect("get");
    assert_eq!(resp.kvs().len(), 1);

    // Cleanup
    client
        .delete(namespace.as_str(), Some(etcd_client::DeleteOptions::new().with_prefix()))
        .await
        .expect("cleanup failed");
}
