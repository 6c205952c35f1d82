//! Stories about requests reaching the end of their lifetime

use std::time::Duration;

use canopy::events::reasons;
use canopy::store::ObjectStore;

use super::helpers::*;

const HOUR: Duration = Duration::from_secs(3600);

/// Story: a forgotten request is reaped after 72 hours, not a minute before
#[tokio::test(start_paused = true)]
async fn story_request_is_deleted_after_its_ttl() {
    let cluster = Cluster::start().await;
    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;
    assert!(cluster.get("ada-viewer").await.unwrap().expiry().is_some());

    tokio::time::sleep(71 * HOUR).await;
    assert!(cluster.get("ada-viewer").await.is_some());

    tokio::time::sleep(Duration::from_secs(59 * 60)).await;
    assert!(cluster.get("ada-viewer").await.is_some());

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert!(cluster.get("ada-viewer").await.is_none());
    assert_eq!(cluster.events.count(reasons::EXPIRED), 1);

    cluster.stop().await;
}

/// Story: requests submitted at different times expire in order
///
/// A later request never pushes back the deadline of an earlier one; once the
/// first is reaped the timer moves on to the next.
#[tokio::test(start_paused = true)]
async fn story_staggered_requests_expire_in_order() {
    let cluster = Cluster::start().await;
    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;
    tokio::time::sleep(10 * HOUR).await;
    cluster
        .submit(role_request("bob-viewer", "bob@example.org", "viewer"))
        .await;

    tokio::time::sleep(63 * HOUR).await;
    assert!(cluster.get("ada-viewer").await.is_none());
    assert!(cluster.get("bob-viewer").await.is_some());

    tokio::time::sleep(10 * HOUR).await;
    assert!(cluster.get("bob-viewer").await.is_none());
    assert_eq!(cluster.store.stats().role_request_deletes, 2);

    cluster.stop().await;
}

/// Story: an approved request expires too, but the binding stays
#[tokio::test(start_paused = true)]
async fn story_approved_request_expires() {
    let cluster = Cluster::start().await;
    cluster
        .store
        .create_acceptable_use_policy(&accepted_policy("ada-aup", "ada@example.org"))
        .await
        .unwrap();
    let mut rr = role_request("ada-viewer", "ada@example.org", "viewer");
    rr.spec.approved = true;
    cluster.submit(rr).await;

    tokio::time::sleep(73 * HOUR).await;
    assert!(cluster.get("ada-viewer").await.is_none());
    assert_eq!(cluster.store.role_bindings(NS).len(), 1);

    cluster.stop().await;
}
