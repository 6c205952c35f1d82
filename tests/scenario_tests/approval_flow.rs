//! Stories about a request travelling from submission to a bound role

use canopy::controller::messages;
use canopy::crd::RoleRequestState;
use canopy::events::reasons;
use canopy::notification::NotificationKind;
use canopy::store::ObjectStore;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::ResourceExt;

use super::helpers::*;

/// Story: a first-time requester consents, gets approved and is bound
///
/// Ada has never asked for access before. The controller creates her an
/// acceptable use policy and waits. An approver signs off first; accepting
/// the policy afterwards is enough to bind the role and tell her, without
/// touching the request again.
#[tokio::test(start_paused = true)]
async fn story_first_request_round_trip() {
    let cluster = Cluster::start().await;
    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;

    assert_eq!(
        cluster.state("ada-viewer").await,
        (
            Some(RoleRequestState::Pending),
            Some(messages::POLICY_NOT_AGREED.to_string())
        )
    );
    let policy = cluster
        .get("ada-viewer")
        .await
        .unwrap()
        .policy_name()
        .unwrap()
        .to_string();
    assert!(policy.starts_with("ada-viewer-"));

    cluster
        .edit("ada-viewer", |rr| rr.spec.approved = true)
        .await;
    assert_eq!(
        cluster.state("ada-viewer").await.0,
        Some(RoleRequestState::Pending)
    );
    assert_eq!(cluster.events.count(reasons::NOT_AGREED), 2);

    cluster.accept_policy(&policy).await;

    assert_eq!(
        cluster.state("ada-viewer").await,
        (
            Some(RoleRequestState::Approved),
            Some(messages::ROLE_APPROVED.to_string())
        )
    );
    let bindings = cluster.store.role_bindings(NS);
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].name_any(), "canopy:clusterrole:viewer");
    assert_eq!(
        bindings[0].subjects.as_ref().unwrap()[0].name,
        "ada@example.org"
    );
    assert_eq!(cluster.notifier.count(NotificationKind::RoleRequestApproved), 1);
    assert_eq!(cluster.events.count(reasons::APPROVED), 1);
    assert_eq!(cluster.store.stats().policy_creates, 1);

    cluster.stop().await;
}

/// Story: approvers hear about a waiting request once, however often it is
/// reconciled
#[tokio::test(start_paused = true)]
async fn story_pending_request_notifies_approvers_once() {
    let cluster = Cluster::start().await;
    cluster.store.add_role_binding(owner_binding("owner@example.org"));
    cluster.store.grant_access("owner@example.org", NS);
    cluster
        .store
        .create_acceptable_use_policy(&accepted_policy("ada-aup", "ada@example.org"))
        .await
        .unwrap();

    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;
    assert_eq!(
        cluster.state("ada-viewer").await.1.as_deref(),
        Some(messages::ROLE_NOT_APPROVED)
    );

    // the requester tweaks the request while it waits
    cluster
        .edit("ada-viewer", |rr| {
            rr.spec.authentication.insert("oidc".to_string());
        })
        .await;
    cluster
        .edit("ada-viewer", |rr| rr.spec.first_name = "Augusta Ada".to_string())
        .await;

    let sent = cluster.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::RoleRequestPending);
    assert_eq!(sent[0].recipients, vec!["owner@example.org"]);

    cluster
        .edit("ada-viewer", |rr| rr.spec.approved = true)
        .await;
    let approved: Vec<_> = cluster
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::RoleRequestApproved)
        .collect();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].auth_methods, vec!["oidc"]);

    cluster.stop().await;
}

/// Story: everyone granted the same ClusterRole shares one binding
///
/// Both requests are bound while their binding writes race each other.
#[tokio::test(start_paused = true)]
async fn story_same_role_shares_one_binding() {
    let cluster = Cluster::start().await;
    cluster.store.interleave_binding_writes(true);
    for (name, email) in [("ada-viewer", "ada@example.org"), ("bob-viewer", "bob@example.org")] {
        cluster
            .store
            .create_acceptable_use_policy(&accepted_policy(&format!("{name}-aup"), email))
            .await
            .unwrap();
        let mut rr = role_request(name, email, "viewer");
        rr.spec.approved = true;
        cluster.store.create_role_request(&rr).await.unwrap();
    }
    cluster.settle().await;

    for name in ["ada-viewer", "bob-viewer"] {
        assert_eq!(
            cluster.state(name).await.0,
            Some(RoleRequestState::Approved)
        );
    }
    let bindings = cluster.store.role_bindings(NS);
    assert_eq!(bindings.len(), 1);
    let mut subjects: Vec<_> = bindings[0]
        .subjects
        .iter()
        .flatten()
        .map(|s| s.name.clone())
        .collect();
    subjects.sort();
    assert_eq!(subjects, vec!["ada@example.org", "bob@example.org"]);
    assert_eq!(cluster.store.stats().binding_creates, 1);
    assert_eq!(cluster.events.count(reasons::BINDING_FAILED), 0);

    cluster.stop().await;
}

/// Story: a typo in the role name fails the request until the reference is
/// fixed
///
/// Creating the missing role afterwards is not enough on its own; the
/// request is only looked at again when its spec changes.
#[tokio::test(start_paused = true)]
async fn story_missing_role_stays_failed_until_reference_changes() {
    let cluster = Cluster::start().await;
    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "veiwer"))
        .await;
    assert_eq!(
        cluster.state("ada-viewer").await,
        (
            Some(RoleRequestState::Failure),
            Some(messages::ROLE_NOT_FOUND.to_string())
        )
    );
    assert_eq!(cluster.events.count(reasons::NOT_FOUND), 1);

    cluster.store.add_cluster_role(ClusterRole {
        metadata: meta("veiwer", None, &[]),
        ..Default::default()
    });
    cluster.settle().await;
    assert_eq!(
        cluster.state("ada-viewer").await.0,
        Some(RoleRequestState::Failure)
    );

    cluster
        .edit("ada-viewer", |rr| rr.spec.role_ref.name = "viewer".to_string())
        .await;
    assert_eq!(
        cluster.state("ada-viewer").await,
        (
            Some(RoleRequestState::Pending),
            Some(messages::POLICY_NOT_AGREED.to_string())
        )
    );

    cluster.stop().await;
}

/// Story: the expiry is fixed at first sight and survives later edits
#[tokio::test(start_paused = true)]
async fn story_expiry_is_set_once() {
    let cluster = Cluster::start().await;
    let submitted = cluster.now();
    cluster
        .submit(role_request("ada-viewer", "ada@example.org", "viewer"))
        .await;

    let expiry = cluster.get("ada-viewer").await.unwrap().expiry().unwrap();
    let offset = expiry - (submitted + chrono::Duration::hours(72));
    assert!(offset >= chrono::Duration::zero());
    assert!(offset < chrono::Duration::seconds(1));

    tokio::time::sleep(std::time::Duration::from_secs(5 * 3600)).await;
    cluster
        .edit("ada-viewer", |rr| rr.spec.last_name = "King".to_string())
        .await;
    assert_eq!(
        cluster.get("ada-viewer").await.unwrap().expiry(),
        Some(expiry)
    );

    cluster.stop().await;
}
