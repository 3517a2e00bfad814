use std::sync::Arc;

use assert_matches::assert_matches;
use ntest::timeout;

use docbase::cluster::config::NodeLocator;
use docbase::cluster::node::BucketKind;
use docbase::errors::{ConnectError, OpenBucketError};

use crate::utils::{bucket_map, harness};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(30000)]
async fn concurrent_opens_share_one_attachment() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("travel-sample", 1, &["10.0.0.1"]));
    let core = Arc::new(h.core);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let core = Arc::clone(&core);
        tasks.push(tokio::spawn(async move {
            core.get_or_create_bucket("travel-sample").await.unwrap()
        }));
    }
    let mut attachments = Vec::new();
    for task in tasks {
        attachments.push(task.await.unwrap());
    }

    assert!(attachments
        .windows(2)
        .all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    // Exactly one attach sequence ran.
    assert_eq!(h.bucket_factory.created(), 1);
}

#[tokio::test]
async fn rate_limited_attach_surfaces_immediately() {
    let h = harness("couchbase://10.0.0.1,10.0.0.2");
    h.cluster.set_bucket_map(bucket_map("b", 1, &["10.0.0.1"]));
    h.cluster.fail_select("b", ConnectError::RateLimited);

    let err = h.core.get_or_create_bucket("b").await.unwrap_err();
    assert_matches!(err, OpenBucketError::RateLimited);
    // Only the first (endpoint, kind) combination was attempted.
    assert_eq!(h.cluster.connect_count(), 1);
    // The attachment never got registered.
    assert!(h.core.get_bucket("b").is_none());
}

#[tokio::test]
async fn unknown_bucket_exhausts_every_combination() {
    let h = harness("couchbase://10.0.0.1");

    let err = h.core.get_or_create_bucket("ghost").await.unwrap_err();
    assert_matches!(err, OpenBucketError::BucketNotFound(name) if name == "ghost");
    // Both bucket kinds were tried on the single seed.
    assert_eq!(h.cluster.connect_count(), 2);
    assert!(h.core.get_bucket("ghost").is_none());
}

#[tokio::test]
async fn memcached_buckets_attach_without_a_select_handshake() {
    let h = harness("couchbase://10.0.0.1");
    // The couchbase-kind port is closed; only the memcached combination works.
    h.cluster.refuse_kind(BucketKind::Couchbase);
    let mut map = bucket_map("cache", 1, &["10.0.0.1", "10.0.0.2"]);
    map.locator = NodeLocator::Ketama;
    h.cluster.set_bucket_map(map);

    let bucket = h.core.get_or_create_bucket("cache").await.unwrap();
    assert_eq!(bucket.kind(), BucketKind::Memcached);
    assert_eq!(h.cluster.select_count(), 0);
    assert_eq!(h.core.get_nodes(Some("cache")).unwrap().len(), 2);
}

#[tokio::test]
async fn rebootstrap_replaces_every_lost_node() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("b", 3, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]));
    let bucket = h.core.get_or_create_bucket("b").await.unwrap();
    let old = h.core.get_nodes(Some("b")).unwrap();
    assert_eq!(old.len(), 3);

    h.core.rebootstrap("b").await.unwrap();

    assert!(old.iter().all(|n| n.is_disposed()));
    let fresh = h.core.get_nodes(Some("b")).unwrap();
    assert_eq!(fresh.len(), 3);
    assert!(fresh
        .iter()
        .all(|n| old.iter().all(|former| former.id != n.id)));
    assert!(bucket.is_bootstrapped());
    assert!(Arc::ptr_eq(&bucket, &h.core.get_bucket("b").unwrap()));
}

#[tokio::test]
async fn rebootstrap_of_an_unknown_bucket_fails() {
    let h = harness("couchbase://10.0.0.1");
    assert_matches!(
        h.core.rebootstrap("nope").await,
        Err(OpenBucketError::BucketNotFound(name)) if name == "nope"
    );
}

#[tokio::test]
async fn remove_bucket_drops_its_nodes() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("b", 1, &["10.0.0.1", "10.0.0.2"]));
    h.core.get_or_create_bucket("b").await.unwrap();
    let nodes = h.core.get_nodes(Some("b")).unwrap();
    assert_eq!(nodes.len(), 2);

    h.core.remove_bucket("b").unwrap();

    assert!(h.core.get_bucket("b").is_none());
    assert!(nodes.iter().all(|n| n.is_disposed()));
    assert!(h.core.get_nodes(None).unwrap().is_empty());
}
