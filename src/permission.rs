//! Tenant permission gate and approver discovery

use std::collections::BTreeSet;
use std::sync::LazyLock;

use kube::ResourceExt;
use regex::Regex;
use tracing::debug;

use crate::store::{AccessReview, ObjectStore};
use crate::{Error, CLUSTER_UID_LABEL, GENERATED_SELECTOR, TENANT_LABEL, TENANT_UID_LABEL};

// The pattern is a literal and covered by tests.
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hardcoded email pattern is valid")
});

/// Binding name fragments that mark a binding as held by approvers
const APPROVER_BINDING_MARKERS: [&str; 3] = ["owner", "admin", "manager"];

/// Outcome of the namespace permission check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceAccess {
    /// Whether requests may exist in the namespace
    pub permitted: bool,
    /// Cluster UID recorded on the namespace, if any
    pub cluster_uid: Option<String>,
}

/// True for a syntactically valid email address
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// UID of the system namespace, which identifies the local cluster
pub async fn local_cluster_uid(
    store: &dyn ObjectStore,
    system_namespace: &str,
) -> Result<String, Error> {
    let namespace = store.get_namespace(system_namespace).await?;
    namespace
        .uid()
        .ok_or_else(|| Error::internal(format!("namespace {system_namespace} has no uid")))
}

/// Decide whether role requests may exist in `namespace`.
///
/// A namespace whose cluster UID label differs from the local cluster was
/// propagated from elsewhere and is permitted as-is. A local namespace needs
/// an enabled owning tenant whose UID matches the namespace's tenant UID label.
pub async fn namespace_access(
    store: &dyn ObjectStore,
    system_namespace: &str,
    namespace: &str,
) -> Result<NamespaceAccess, Error> {
    let local_uid = local_cluster_uid(store, system_namespace).await?;
    let ns = store.get_namespace(namespace).await?;
    let labels = ns.labels();
    let cluster_uid = labels.get(CLUSTER_UID_LABEL).cloned();

    if cluster_uid.as_deref().unwrap_or_default() != local_uid {
        debug!(namespace, ?cluster_uid, "namespace owned by another cluster");
        return Ok(NamespaceAccess {
            permitted: true,
            cluster_uid,
        });
    }

    let tenant_name = labels
        .get(TENANT_LABEL)
        .map(|t| t.to_lowercase())
        .unwrap_or_default();
    let permitted = if tenant_name.is_empty() {
        false
    } else {
        match store.get_tenant(&tenant_name).await {
            Ok(tenant) => {
                tenant.spec.enabled
                    && tenant.uid().is_some()
                    && tenant.uid().as_ref() == labels.get(TENANT_UID_LABEL)
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        }
    };

    debug!(namespace, tenant = %tenant_name, permitted, "tenant permission checked");
    Ok(NamespaceAccess {
        permitted,
        cluster_uid,
    })
}

/// Emails of users allowed to approve `request_name` in `namespace`.
///
/// Candidates are `User` subjects of generated owner/admin/manager bindings in
/// the namespace. Each one must hold a valid email and pass an access review
/// for updating the request. Cluster-wide bindings are ignored.
pub async fn approver_emails(
    store: &dyn ObjectStore,
    namespace: &str,
    request_name: &str,
) -> Result<Vec<String>, Error> {
    let bindings = store
        .list_role_bindings(namespace, GENERATED_SELECTOR)
        .await?;

    let candidates: BTreeSet<String> = bindings
        .iter()
        .filter(|b| {
            let name = b.name_any();
            APPROVER_BINDING_MARKERS.iter().any(|m| name.contains(m))
        })
        .flat_map(|b| b.subjects.iter().flatten())
        .filter(|s| s.kind == "User" && is_valid_email(&s.name))
        .map(|s| s.name.clone())
        .collect();

    let mut approvers = Vec::with_capacity(candidates.len());
    for user in candidates {
        let review = AccessReview {
            user: user.clone(),
            namespace: namespace.to_string(),
            verb: "update".to_string(),
            group: "registration.canopy.dev".to_string(),
            resource: "rolerequests".to_string(),
            name: request_name.to_string(),
        };
        match store.review_access(&review).await {
            Ok(true) => approvers.push(user),
            Ok(false) => debug!(%user, namespace, "candidate approver denied by access review"),
            Err(e) => debug!(%user, namespace, error = %e, "access review failed"),
        }
    }
    Ok(approvers)
}
