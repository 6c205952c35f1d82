//! Stories about which namespaces may hold role requests

use canopy::crd::RoleRequestState;
use canopy::events::reasons;
use canopy::store::ObjectStore;
use canopy::{CLUSTER_UID_LABEL, TENANT_LABEL};
use k8s_openapi::api::core::v1::Namespace;

use super::helpers::*;

/// Story: a tenant that has been switched off loses its requests
#[tokio::test(start_paused = true)]
async fn story_disabled_tenant_request_is_deleted() {
    let cluster = Cluster::start().await;
    cluster.store.add_tenant(tenant(false));

    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;

    assert!(cluster.get("ada-viewer").await.is_none());
    assert_eq!(cluster.events.count(reasons::DELETED), 1);
    assert_eq!(cluster.store.stats().status_updates, 0);
    assert_eq!(cluster.store.stats().policy_creates, 0);

    cluster.stop().await;
}

/// Story: a namespace naming a tenant that does not exist holds no requests
#[tokio::test(start_paused = true)]
async fn story_missing_tenant_request_is_deleted() {
    let cluster = Cluster::start().await;
    cluster.store.add_namespace(Namespace {
        metadata: meta(
            "team-b",
            None,
            &[(CLUSTER_UID_LABEL, LOCAL_UID), (TENANT_LABEL, "ghost")],
        ),
        ..Default::default()
    });

    let mut rr = role_request("ada-viewer", "ada@example.org", "viewer");
    rr.metadata.namespace = Some("team-b".to_string());
    cluster.submit(rr).await;

    assert!(cluster
        .store
        .list_role_requests()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(cluster.events.count(reasons::DELETED), 1);

    cluster.stop().await;
}

/// Story: namespaces propagated from another cluster are trusted as-is
#[tokio::test(start_paused = true)]
async fn story_foreign_namespace_is_permitted() {
    let cluster = Cluster::start().await;
    cluster.store.add_namespace(Namespace {
        metadata: meta("mirror", None, &[(CLUSTER_UID_LABEL, "other-cluster-uid")]),
        ..Default::default()
    });

    let mut rr = role_request("ada-viewer", "ada@example.org", "viewer");
    rr.metadata.namespace = Some("mirror".to_string());
    cluster.submit(rr).await;

    let stored = cluster
        .store
        .get_role_request("mirror", "ada-viewer")
        .await
        .unwrap();
    assert_eq!(stored.state(), Some(RoleRequestState::Pending));

    let policy = cluster
        .store
        .get_acceptable_use_policy(stored.policy_name().unwrap())
        .await
        .unwrap();
    assert_eq!(
        policy.metadata.labels.unwrap().get(CLUSTER_UID_LABEL).map(String::as_str),
        Some("other-cluster-uid")
    );

    cluster.stop().await;
}
