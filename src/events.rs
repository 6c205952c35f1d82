//! Events recorded against RoleRequests.
//!
//! Every approval step reports its outcome here so `kubectl describe
//! rolerequest` shows how a request got to its current state. Publishing
//! never fails a reconcile; a rejected event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Sink for RoleRequest events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason` against the referenced request
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Writes events to the cluster as the controller's reporter.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `POD_NAME` becomes the reporting instance when set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "dropping RoleRequest event"
            );
        }
    }
}

/// Used when the controller runs without a cluster to report to.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// `namespace/name` of the object
    pub object: String,
    /// Normal or Warning
    pub type_: EventType,
    /// Reason column
    pub reason: String,
    /// Action column
    pub action: String,
    /// Free-form note
    pub note: Option<String>,
}

/// Keeps published events in memory, for tests and dry runs.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    /// Number of events published with `reason`
    pub fn count(&self, reason: &str) -> usize {
        self.events.lock().iter().filter(|e| e.reason == reason).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object = match (&resource_ref.namespace, &resource_ref.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        self.events.lock().push(RecordedEvent {
            object,
            type_,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// REASON column values
pub mod reasons {
    /// Reconcile finished without error
    pub const SYNCED: &str = "Synced";
    /// Requested Role or ClusterRole exists
    pub const FOUND: &str = "Found";
    /// Requested Role or ClusterRole does not exist
    pub const NOT_FOUND: &str = "NotFound";
    /// Acceptable use policy could not be created
    pub const POLICY_CREATION_FAILED: &str = "CreationFailed";
    /// Acceptable use policy is not accepted yet
    pub const NOT_AGREED: &str = "NotAgreed";
    /// Waiting for an approver
    pub const NOT_APPROVED: &str = "NotApproved";
    /// Request approved, binding in progress
    pub const APPROVED: &str = "Approved";
    /// Requester could not be added to the role binding
    pub const BINDING_FAILED: &str = "BindingFailed";
    /// Request labels were updated by the controller
    pub const UPDATED: &str = "Updated";
    /// Namespace is not permitted, request removed
    pub const DELETED: &str = "Deleted";
    /// Client certificate could not be generated
    pub const GENERATION_FAILED: &str = "GenerationFailed";
    /// Kubeconfig could not be written
    pub const KUBECONFIG_FAILED: &str = "KubeconfigFailed";
    /// Request reached its expiry
    pub const EXPIRED: &str = "Expired";
}

/// ACTION column values
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Linking the acceptable use policy
    pub const LINK_POLICY: &str = "LinkPolicy";
    /// Checking the requested role
    pub const CHECK_ROLE: &str = "CheckRole";
    /// Waiting on the requester or an approver
    pub const AWAIT: &str = "Await";
    /// Adding the requester to the role binding
    pub const BIND_ROLE: &str = "BindRole";
    /// Issuing credentials
    pub const ISSUE_CREDENTIALS: &str = "IssueCredentials";
    /// Deleting the request
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[test]
    fn reasons_have_no_spaces() {
        for reason in [
            reasons::SYNCED,
            reasons::FOUND,
            reasons::NOT_FOUND,
            reasons::POLICY_CREATION_FAILED,
            reasons::NOT_AGREED,
            reasons::NOT_APPROVED,
            reasons::APPROVED,
            reasons::BINDING_FAILED,
            reasons::GENERATION_FAILED,
            reasons::KUBECONFIG_FAILED,
        ] {
            assert!(!reason.contains(' '), "{reason}");
        }
        assert_eq!(reasons::POLICY_CREATION_FAILED, "CreationFailed");
    }

    #[tokio::test]
    async fn recording_publisher_keeps_order_and_object() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference {
            namespace: Some("team-a".to_string()),
            name: Some("ada".to_string()),
            ..Default::default()
        };
        publisher
            .publish(&obj_ref, EventType::Warning, reasons::NOT_FOUND, actions::CHECK_ROLE, None)
            .await;
        publisher
            .publish(&obj_ref, EventType::Normal, reasons::SYNCED, actions::RECONCILE, None)
            .await;

        assert_eq!(publisher.reasons(), vec!["NotFound", "Synced"]);
        assert_eq!(publisher.count(reasons::SYNCED), 1);
        let events = publisher.events();
        assert_eq!(events[0].object, "team-a/ada");
        assert_eq!(events[0].type_, EventType::Warning);
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::SYNCED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
