//! RoleRequest Custom Resource Definition
//!
//! A RoleRequest asks for a Role or ClusterRole in one namespace to be granted
//! to a user identified by email. The controller walks it through consent and
//! approval and records the outcome in status.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ACCEPTABLE_USE_POLICY_LABEL;

/// Authentication method that provisions a client certificate and kubeconfig
pub const AUTH_CLIENT_CERTIFICATE: &str = "client-certificate";

/// Authentication method served by the cluster's OIDC provider
pub const AUTH_OIDC: &str = "oidc";

/// Specification for a RoleRequest
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "registration.canopy.dev",
    version = "v1alpha1",
    kind = "RoleRequest",
    plural = "rolerequests",
    shortname = "rr",
    status = "RoleRequestStatus",
    namespaced,
    printcolumn = r#"{"name":"Email","type":"string","jsonPath":".spec.email"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.roleRef.name"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Expiry","type":"date","jsonPath":".status.expiry"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequestSpec {
    /// Requester's first name
    pub first_name: String,

    /// Requester's last name
    pub last_name: String,

    /// Requester's email, used as the RBAC subject name
    pub email: String,

    /// Role or ClusterRole being requested
    pub role_ref: RoleRequestRef,

    /// Set by an approver to grant the request
    #[serde(default)]
    pub approved: bool,

    /// Authentication methods to provision once approved
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    #[schemars(with = "Vec<String>")]
    pub authentication: BTreeSet<String>,
}

impl RoleRequestSpec {
    /// "First Last", as shown in notifications
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Reference to the requested role
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequestRef {
    /// Role or ClusterRole
    pub kind: RoleKind,

    /// Name of the role
    pub name: String,
}

impl RoleRequestRef {
    /// Name of the generated binding shared by every request for this role
    pub fn binding_name(&self) -> String {
        format!("canopy:{}:{}", self.kind.binding_prefix(), self.name).to_lowercase()
    }
}

/// Kind of role a request refers to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RoleKind {
    /// Namespaced Role in the request's namespace
    Role,
    /// Cluster-wide ClusterRole, bound within the request's namespace
    ClusterRole,
}

impl RoleKind {
    fn binding_prefix(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::ClusterRole => "clusterrole",
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Role => write!(f, "Role"),
            Self::ClusterRole => write!(f, "ClusterRole"),
        }
    }
}

/// Lifecycle state of a RoleRequest
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RoleRequestState {
    /// Waiting on policy consent or approval
    Pending,
    /// Binding is in place
    Approved,
    /// Cannot progress until the request is changed
    Failure,
}

impl std::fmt::Display for RoleRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Approved => write!(f, "Approved"),
            Self::Failure => write!(f, "Failure"),
        }
    }
}

/// Status for a RoleRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequestStatus {
    /// Current state; unset until the first decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RoleRequestState>,

    /// Human-readable explanation of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the controller deletes the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl RoleRequestStatus {
    /// Create a status with the given state and message
    pub fn with_state(state: RoleRequestState, message: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            message: Some(message.into()),
            expiry: None,
        }
    }

    /// Set state and message together
    pub fn set(&mut self, state: RoleRequestState, message: impl Into<String>) {
        self.state = Some(state);
        self.message = Some(message.into());
    }

    /// Set the expiry and return self for chaining
    pub fn expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// True when state and message are exactly the given pair
    pub fn is(&self, state: RoleRequestState, message: &str) -> bool {
        self.state == Some(state) && self.message.as_deref() == Some(message)
    }
}

impl RoleRequest {
    /// Current state, if any decision has been recorded
    pub fn state(&self) -> Option<RoleRequestState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Expiry recorded in status
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.expiry)
    }

    /// Name of the AcceptableUsePolicy this request is linked to
    pub fn policy_name(&self) -> Option<&str> {
        self.labels()
            .get(ACCEPTABLE_USE_POLICY_LABEL)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_spec() -> RoleRequestSpec {
        RoleRequestSpec {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.org".to_string(),
            role_ref: RoleRequestRef {
                kind: RoleKind::ClusterRole,
                name: "Tenant-Viewer".to_string(),
            },
            approved: false,
            authentication: BTreeSet::from(["oidc".to_string()]),
        }
    }

    #[test]
    fn crd_has_expected_identity() {
        let crd = RoleRequest::crd();
        assert_eq!(crd.spec.group, "registration.canopy.dev");
        assert_eq!(crd.spec.names.kind, "RoleRequest");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["rr".to_string()])
        );
    }

    /// Story: every request for the same role lands on the same binding
    ///
    /// Binding names are derived only from role kind and name, lowercased, so
    /// two users asking for "Tenant-Viewer" converge on one RoleBinding.
    #[test]
    fn story_binding_name_is_derived_from_role() {
        let spec = sample_spec();
        assert_eq!(spec.role_ref.binding_name(), "canopy:clusterrole:tenant-viewer");

        let role = RoleRequestRef {
            kind: RoleKind::Role,
            name: "deployer".to_string(),
        };
        assert_eq!(role.binding_name(), "canopy:role:deployer");
    }

    #[test]
    fn spec_serializes_camel_case() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["roleRef"]["kind"], "ClusterRole");
        assert_eq!(json["authentication"][0], "oidc");
    }

    #[test]
    fn yaml_without_optional_fields_parses() {
        let yaml = r#"
firstName: Grace
lastName: Hopper
email: grace@example.org
roleRef:
  kind: Role
  name: editor
"#;
        let spec: RoleRequestSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(!spec.approved);
        assert!(spec.authentication.is_empty());
        assert_eq!(spec.role_ref.kind, RoleKind::Role);
        assert_eq!(spec.full_name(), "Grace Hopper");
    }

    #[test]
    fn status_equality_covers_every_field() {
        let expiry = Utc::now();
        let a = RoleRequestStatus::with_state(RoleRequestState::Pending, "awaiting role approval")
            .expiry(expiry);
        let mut b = a.clone();
        assert_eq!(a, b);

        b.expiry = Some(expiry + chrono::Duration::seconds(1));
        assert_ne!(a, b);

        let mut c = a.clone();
        c.set(RoleRequestState::Pending, "something else");
        assert_ne!(a, c);
        assert!(a.is(RoleRequestState::Pending, "awaiting role approval"));
        assert!(!c.is(RoleRequestState::Pending, "awaiting role approval"));
    }

    #[test]
    fn empty_policy_label_is_ignored() {
        let mut rr = RoleRequest::new("ada", sample_spec());
        assert_eq!(rr.policy_name(), None);

        rr.labels_mut()
            .insert(ACCEPTABLE_USE_POLICY_LABEL.to_string(), String::new());
        assert_eq!(rr.policy_name(), None);

        rr.labels_mut().insert(
            ACCEPTABLE_USE_POLICY_LABEL.to_string(),
            "ada-k3j9x2".to_string(),
        );
        assert_eq!(rr.policy_name(), Some("ada-k3j9x2"));
    }
}
