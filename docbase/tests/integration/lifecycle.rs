use std::sync::Arc;

use assert_matches::assert_matches;

use docbase::errors::{BootstrapError, OpenBucketError, SelectionError};
use docbase::ServiceType;

use crate::utils::{bucket_map, global_map, harness, wait_for};

#[tokio::test]
async fn dispose_tears_everything_down_exactly_once() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_global(global_map(1, &["10.0.0.1", "10.0.0.2"]));
    h.cluster
        .set_bucket_map(bucket_map("b", 2, &["10.0.0.1", "10.0.0.2"]));
    h.core.start().unwrap();
    h.core.bootstrap_global().await.unwrap();
    h.core.get_or_create_bucket("b").await.unwrap();

    let nodes = h.core.get_nodes(None).unwrap();
    assert!(!nodes.is_empty());

    h.core.dispose();

    assert!(h.core.is_disposed());
    assert!(nodes.iter().all(|n| n.is_disposed()));
    assert_matches!(
        h.core.bootstrap_global().await,
        Err(BootstrapError::Disposed)
    );
    assert_matches!(
        h.core.get_or_create_bucket("b").await,
        Err(OpenBucketError::Disposed)
    );
    assert_matches!(
        h.core.get_random_node_for_service(ServiceType::Query, None),
        Err(SelectionError::Disposed)
    );
    assert!(h.core.publish_config(bucket_map("b", 9, &[])).is_err());
    assert!(h.core.get_nodes(None).is_err());

    // A second dispose is a no-op.
    h.core.dispose();
}

#[tokio::test]
async fn remove_node_reports_presence_and_disposes() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster.set_global(global_map(1, &["10.0.0.1"]));
    h.core.bootstrap_global().await.unwrap();
    let node = h.core.get_nodes(None).unwrap().pop().unwrap();

    assert!(h.core.remove_node(&node.endpoint).unwrap());
    assert!(node.is_disposed());
    assert!(!h.core.remove_node(&node.endpoint).unwrap());
    assert!(h.core.get_nodes(None).unwrap().is_empty());
}

#[tokio::test]
async fn disposal_cancels_an_inflight_bootstrap() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster.hang_connects();
    let core = Arc::new(h.core);

    let task = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.bootstrap_global().await })
    };
    wait_for(|| h.cluster.connect_count() >= 1).await;
    core.dispose();

    assert_matches!(task.await.unwrap(), Err(BootstrapError::Cancelled));
}

#[tokio::test]
async fn unregistered_buckets_no_longer_receive_maps() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("b", 1, &["10.0.0.1", "10.0.0.2"]));
    h.core.start().unwrap();
    let bucket = h.core.get_or_create_bucket("b").await.unwrap();

    h.core.unregister_bucket("b").unwrap();
    h.core
        .publish_config(bucket_map("b", 2, &["10.0.0.1"]))
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The map for the unsubscribed bucket was dropped on the floor.
    assert_eq!(bucket.last_applied_rev(), Some(1));
    assert_eq!(h.core.get_nodes(None).unwrap().len(), 2);

    // Re-registering resumes delivery.
    h.core.register_bucket(Arc::clone(&bucket)).unwrap();
    h.core
        .publish_config(bucket_map("b", 3, &["10.0.0.1"]))
        .unwrap();
    wait_for(|| bucket.last_applied_rev() == Some(3)).await;
    assert_eq!(h.core.get_nodes(None).unwrap().len(), 1);
}
