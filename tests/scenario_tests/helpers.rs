//! Shared fixtures: a seeded in-memory cluster with a running controller

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use canopy::clock::{Clock, TokioClock};
use canopy::controller::{Context, RoleRequestController};
use canopy::crd::{
    AcceptableUsePolicy, AcceptableUsePolicySpec, RoleKind, RoleRequest, RoleRequestRef,
    RoleRequestSpec, RoleRequestState, Tenant, TenantContact, TenantSpec,
};
use canopy::events::RecordingEventPublisher;
use canopy::notification::RecordingNotifier;
use canopy::store::{InMemoryStore, ObjectStore};
use canopy::{CLUSTER_UID_LABEL, GENERATED_LABEL, TENANT_LABEL, TENANT_UID_LABEL};

pub const LOCAL_UID: &str = "3f1c2a9e-local";
pub const TENANT_UID: &str = "8d02b7c4-acme";
pub const NS: &str = "team-a";

pub fn meta(name: &str, namespace: Option<&str>, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn tenant(enabled: bool) -> Tenant {
    let mut tenant = Tenant::new(
        "acme",
        TenantSpec {
            full_name: "Acme Research".to_string(),
            short_name: "acme".to_string(),
            url: Some("https://acme.example".to_string()),
            contact: TenantContact {
                first_name: "Wile".to_string(),
                last_name: "Coyote".to_string(),
                email: "wile@acme.example".to_string(),
            },
            enabled,
        },
    );
    tenant.metadata.uid = Some(TENANT_UID.to_string());
    tenant
}

/// Namespace owned by the local cluster and the given tenant
pub fn tenant_namespace(name: &str, tenant: &str) -> Namespace {
    Namespace {
        metadata: meta(
            name,
            None,
            &[
                (CLUSTER_UID_LABEL, LOCAL_UID),
                (TENANT_LABEL, tenant),
                (TENANT_UID_LABEL, TENANT_UID),
            ],
        ),
        ..Default::default()
    }
}

pub fn role_request(name: &str, email: &str, role: &str) -> RoleRequest {
    let mut rr = RoleRequest::new(
        name,
        RoleRequestSpec {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: email.to_string(),
            role_ref: RoleRequestRef {
                kind: RoleKind::ClusterRole,
                name: role.to_string(),
            },
            approved: false,
            authentication: BTreeSet::new(),
        },
    );
    rr.metadata.namespace = Some(NS.to_string());
    rr
}

pub fn accepted_policy(name: &str, email: &str) -> AcceptableUsePolicy {
    let mut policy = AcceptableUsePolicy::new(
        name,
        AcceptableUsePolicySpec {
            email: email.to_string(),
            accepted: true,
        },
    );
    policy.metadata.labels = Some(BTreeMap::from([(
        GENERATED_LABEL.to_string(),
        "true".to_string(),
    )]));
    policy
}

pub fn owner_binding(user: &str) -> RoleBinding {
    RoleBinding {
        metadata: meta("canopy:clusterrole:owner", Some(NS), &[(GENERATED_LABEL, "true")]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "owner".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "User".to_string(),
            name: user.to_string(),
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            namespace: None,
        }]),
    }
}

/// A seeded in-memory cluster with the controller running against it
pub struct Cluster {
    pub clock: Arc<TokioClock>,
    pub store: Arc<InMemoryStore>,
    pub events: Arc<RecordingEventPublisher>,
    pub notifier: Arc<RecordingNotifier>,
    pub controller: Arc<RoleRequestController>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), canopy::Error>>,
}

impl Cluster {
    /// Local cluster with tenant `acme` owning `team-a` and a `viewer` ClusterRole
    pub async fn start() -> Self {
        let anchor = DateTime::parse_from_rfc3339("2026-05-04T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(TokioClock::starting_at(anchor));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));

        let mut system = Namespace {
            metadata: meta("kube-system", None, &[]),
            ..Default::default()
        };
        system.metadata.uid = Some(LOCAL_UID.to_string());
        store.add_namespace(system);
        store.add_namespace(tenant_namespace(NS, "Acme"));
        store.add_tenant(tenant(true));
        store.add_cluster_role(ClusterRole {
            metadata: meta("viewer", None, &[]),
            ..Default::default()
        });

        let events = Arc::new(RecordingEventPublisher::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = Context::builder(store.clone())
            .events(events.clone())
            .notifier(notifier.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let controller = RoleRequestController::new(Arc::new(ctx));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(2, cancel.clone()));

        let cluster = Self {
            clock,
            store,
            events,
            notifier,
            controller,
            cancel,
            handle,
        };
        cluster.settle().await;
        cluster
    }

    /// Let every reconcile and notification triggered so far finish
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.controller.context().notifications.wait_idle().await;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn submit(&self, rr: RoleRequest) {
        self.store.create_role_request(&rr).await.unwrap();
        self.settle().await;
    }

    pub async fn get(&self, name: &str) -> Option<RoleRequest> {
        match self.store.get_role_request(NS, name).await {
            Ok(rr) => Some(rr),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }

    pub async fn state(&self, name: &str) -> (Option<RoleRequestState>, Option<String>) {
        let status = self
            .get(name)
            .await
            .and_then(|rr| rr.status)
            .unwrap_or_default();
        (status.state, status.message)
    }

    /// Apply a spec change the way a user editing the object would
    pub async fn edit(&self, name: &str, change: impl FnOnce(&mut RoleRequest)) {
        let mut rr = self.get(name).await.unwrap();
        change(&mut rr);
        self.store.update_role_request(&rr).await.unwrap();
        self.settle().await;
    }

    pub async fn accept_policy(&self, name: &str) {
        let mut policy = self.store.get_acceptable_use_policy(name).await.unwrap();
        policy.spec.accepted = true;
        self.store.update_acceptable_use_policy(&policy).await.unwrap();
        self.settle().await;
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}
