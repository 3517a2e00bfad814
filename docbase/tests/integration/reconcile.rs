use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::utils::{bucket_map, global_map, harness, harness_with, wait_for};

#[tokio::test]
async fn new_map_prunes_nodes_absent_from_it() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("b", 1, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]));
    h.core.start().unwrap();
    h.core.get_or_create_bucket("b").await.unwrap();

    let before = h.core.get_nodes(None).unwrap();
    let doomed = before
        .iter()
        .find(|n| n.endpoint.host() == "10.0.0.2")
        .cloned()
        .expect("node B present");

    h.core
        .publish_config(bucket_map("b", 2, &["10.0.0.1", "10.0.0.3"]))
        .unwrap();
    wait_for(|| h.core.get_nodes(None).unwrap().len() == 2).await;

    assert!(doomed.is_disposed());
    // The owning bucket observes the removal too.
    assert_eq!(h.core.get_nodes(Some("b")).unwrap().len(), 2);
    let survivors = h.core.get_nodes(None).unwrap();
    assert!(survivors.iter().all(|n| n.endpoint.host() != "10.0.0.2"));
    assert!(survivors.iter().all(|n| !n.is_disposed()));
    assert_eq!(
        h.core.get_bucket("b").unwrap().last_applied_rev(),
        Some(2)
    );
}

#[tokio::test]
async fn stale_revisions_are_discarded() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_bucket_map(bucket_map("b", 5, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]));
    h.core.start().unwrap();
    h.core.get_or_create_bucket("b").await.unwrap();
    assert_eq!(h.core.get_bucket("b").unwrap().last_applied_rev(), Some(5));

    // An old revision that, if applied, would prune two nodes.
    h.core
        .publish_config(bucket_map("b", 3, &["10.0.0.1"]))
        .unwrap();
    // A newer one that keeps the topology as-is.
    h.core
        .publish_config(bucket_map("b", 6, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
        .unwrap();

    wait_for(|| h.core.get_bucket("b").unwrap().last_applied_rev() == Some(6)).await;
    // Deliveries are serialized in order, so rev 3 was already discarded.
    assert_eq!(h.core.get_nodes(None).unwrap().len(), 3);
}

#[tokio::test]
async fn global_maps_reshape_the_registry() {
    let h = harness("couchbase://10.0.0.1");
    h.cluster
        .set_global(global_map(4, &["10.0.0.1", "10.0.0.2"]));
    h.core.start().unwrap();
    h.core.bootstrap_global().await.unwrap();

    let before: HashSet<Uuid> = h
        .core
        .get_nodes(None)
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect();
    let doomed = h
        .core
        .get_nodes(None)
        .unwrap()
        .into_iter()
        .find(|n| n.endpoint.host() == "10.0.0.2")
        .expect("node at 10.0.0.2 present");

    // Re-delivering the very bootstrap map is discarded by the revision gate:
    // no additions, no removals.
    let held = (*h.core.global_config().unwrap()).clone();
    h.core.publish_config(held).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after: HashSet<Uuid> = h
        .core
        .get_nodes(None)
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(before, after);
    assert_eq!(h.core.global_config().unwrap().rev, 4);

    // A newer global map connects the node it adds and prunes the one it
    // drops, without any bucket being open.
    let mut next = global_map(5, &["10.0.0.1", "10.0.0.3"]);
    next.is_global = true;
    h.core.publish_config(next).unwrap();
    wait_for(|| h.core.global_config().unwrap().rev == 5).await;

    let hosts: HashSet<String> = h
        .core
        .get_nodes(None)
        .unwrap()
        .iter()
        .map(|n| n.endpoint.host().to_owned())
        .collect();
    assert!(hosts.contains("10.0.0.1"));
    assert!(hosts.contains("10.0.0.3"));
    assert!(!hosts.contains("10.0.0.2"));
    assert!(doomed.is_disposed());

    let added = h
        .core
        .get_nodes(None)
        .unwrap()
        .into_iter()
        .find(|n| n.endpoint.host() == "10.0.0.3")
        .expect("node at 10.0.0.3 connected");
    assert!(added.is_unassigned());
    assert!(added.adapter().is_some());
}

#[tokio::test(start_paused = true)]
async fn poller_pulls_and_applies_fresh_maps() {
    let h = harness_with("couchbase://10.0.0.1", Vec::new(), true);
    h.cluster
        .set_bucket_map(bucket_map("b", 1, &["10.0.0.1", "10.0.0.2"]));
    h.core.start().unwrap();
    h.core.get_or_create_bucket("b").await.unwrap();
    assert_eq!(h.core.get_nodes(None).unwrap().len(), 2);

    // The server moves on; the next poll picks the new revision up.
    h.cluster.set_bucket_map(bucket_map("b", 2, &["10.0.0.1"]));
    wait_for(|| h.core.get_bucket("b").unwrap().last_applied_rev() == Some(2)).await;

    assert_eq!(h.core.get_nodes(None).unwrap().len(), 1);
    assert_eq!(h.core.get_nodes(Some("b")).unwrap().len(), 1);
}
