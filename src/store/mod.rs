//! Object store abstraction
//!
//! Every read and write the controller performs goes through [`ObjectStore`].
//! [`KubeObjectStore`] talks to the API server; [`InMemoryStore`] keeps objects
//! in process with the same resource-version, generation and watch semantics,
//! so the full controller can be exercised without a cluster.

mod kubernetes;
mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AcceptableUsePolicy, RoleRequest, Tenant};
use crate::Error;

pub use kubernetes::KubeObjectStore;
pub use memory::{InMemoryStore, StoreStats};

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// Parse `namespace/name` or `name`
    pub fn parse(key: &str) -> Result<Self, Error> {
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::namespaced(*namespace, *name))
            }
            _ => Err(Error::validation(format!("invalid object key '{key}'"))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Never-ending watch: re-lists after every disconnect and backs off on errors
pub type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Subject access review question: may `user` perform `verb` on the object?
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessReview {
    /// User being checked
    pub user: String,
    /// Namespace of the object
    pub namespace: String,
    /// API verb, e.g. `update`
    pub verb: String,
    /// API group of the resource
    pub group: String,
    /// Plural resource name, e.g. `rolerequests`
    pub resource: String,
    /// Object name
    pub name: String,
}

/// Typed CRUD, watch and authorization access to the cluster.
///
/// Errors are classified: a missing object is [`Error::NotFound`], a stale
/// resource version is [`Error::Conflict`], a duplicate create is
/// [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a RoleRequest
    async fn get_role_request(&self, namespace: &str, name: &str) -> Result<RoleRequest, Error>;

    /// List RoleRequests across all namespaces
    async fn list_role_requests(&self) -> Result<Vec<RoleRequest>, Error>;

    /// Create a RoleRequest
    async fn create_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error>;

    /// Replace metadata and spec of a RoleRequest (status is ignored)
    async fn update_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error>;

    /// Replace the status of a RoleRequest, guarded by its resource version
    async fn update_role_request_status(&self, request: &RoleRequest)
        -> Result<RoleRequest, Error>;

    /// Delete a RoleRequest
    async fn delete_role_request(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Watch RoleRequests across all namespaces
    fn watch_role_requests(&self) -> WatchStream<RoleRequest>;

    /// Watch AcceptableUsePolicies
    fn watch_acceptable_use_policies(&self) -> WatchStream<AcceptableUsePolicy>;

    /// Get an AcceptableUsePolicy
    async fn get_acceptable_use_policy(&self, name: &str) -> Result<AcceptableUsePolicy, Error>;

    /// List AcceptableUsePolicies matching a label selector (empty = all)
    async fn list_acceptable_use_policies(
        &self,
        label_selector: &str,
    ) -> Result<Vec<AcceptableUsePolicy>, Error>;

    /// Create an AcceptableUsePolicy
    async fn create_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error>;

    /// Replace an AcceptableUsePolicy
    async fn update_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error>;

    /// Get a Namespace
    async fn get_namespace(&self, name: &str) -> Result<Namespace, Error>;

    /// Get a Tenant
    async fn get_tenant(&self, name: &str) -> Result<Tenant, Error>;

    /// List Roles in a namespace
    async fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, Error>;

    /// List ClusterRoles
    async fn list_cluster_roles(&self) -> Result<Vec<ClusterRole>, Error>;

    /// List RoleBindings in a namespace matching a label selector (empty = all)
    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, Error>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;

    /// Replace a RoleBinding, guarded by its resource version
    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;

    /// Ask the authorizer whether a user may perform an action
    async fn review_access(&self, review: &AccessReview) -> Result<bool, Error>;
}

/// Evaluate an equality-based label selector (`a=b,c!=d,e`) against labels.
pub fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::namespaced("team-a/alice", ObjectKey::namespaced("team-a", "alice"))]
    #[case::cluster_scoped("alice-k2j4x9", ObjectKey::cluster("alice-k2j4x9"))]
    fn parses_object_keys(#[case] input: &str, #[case] expected: ObjectKey) {
        let key = ObjectKey::parse(input).unwrap();
        assert_eq!(key, expected);
        assert_eq!(key.to_string(), input);
    }

    #[rstest]
    #[case::empty("")]
    #[case::missing_name("team-a/")]
    #[case::too_many_parts("a/b/c")]
    fn rejects_malformed_keys(#[case] input: &str) {
        assert!(ObjectKey::parse(input).is_err());
    }

    #[rstest]
    #[case::empty_selector("", true)]
    #[case::equality("canopy.dev/generated=true", true)]
    #[case::double_equals("canopy.dev/generated==true", true)]
    #[case::mismatch("canopy.dev/generated=false", false)]
    #[case::inequality("canopy.dev/cluster-uid!=abc", true)]
    #[case::existence("canopy.dev/cluster-uid", true)]
    #[case::missing_key("canopy.dev/tenant", false)]
    #[case::conjunction("canopy.dev/generated=true,canopy.dev/cluster-uid=xyz", true)]
    fn evaluates_label_selectors(#[case] selector: &str, #[case] expected: bool) {
        let labels = BTreeMap::from([
            ("canopy.dev/generated".to_string(), "true".to_string()),
            ("canopy.dev/cluster-uid".to_string(), "xyz".to_string()),
        ]);
        assert_eq!(selector_matches(&labels, selector), expected);
    }
}
