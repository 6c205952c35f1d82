//! [`ObjectStore`] backed by the Kubernetes API server

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use super::{AccessReview, ObjectKey, ObjectStore, WatchStream};
use crate::crd::{AcceptableUsePolicy, RoleRequest, Tenant};
use crate::{Error, FIELD_MANAGER};

/// Map API status codes onto the store error taxonomy
fn classify(err: kube::Error, kind: &'static str, key: impl Into<String>) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, key),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind, key)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, key),
        _ => Error::Kube(err),
    }
}

/// Server-side watch timeout, well below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watch_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}

fn list_params(label_selector: &str) -> ListParams {
    if label_selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(label_selector)
    }
}

/// Object store over a kube [`Client`]
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn role_requests(&self, namespace: &str) -> Api<RoleRequest> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespace_of(request: &RoleRequest) -> Result<String, Error> {
        request
            .namespace()
            .ok_or_else(|| Error::validation("RoleRequest has no namespace"))
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_role_request(&self, namespace: &str, name: &str) -> Result<RoleRequest, Error> {
        self.role_requests(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, "RoleRequest", format!("{namespace}/{name}")))
    }

    async fn list_role_requests(&self) -> Result<Vec<RoleRequest>, Error> {
        let api: Api<RoleRequest> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error> {
        let namespace = Self::namespace_of(request)?;
        self.role_requests(&namespace)
            .create(&PostParams::default(), request)
            .await
            .map_err(|e| classify(e, "RoleRequest", ObjectKey::of(request).to_string()))
    }

    async fn update_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error> {
        let namespace = Self::namespace_of(request)?;
        self.role_requests(&namespace)
            .replace(&request.name_any(), &PostParams::default(), request)
            .await
            .map_err(|e| classify(e, "RoleRequest", ObjectKey::of(request).to_string()))
    }

    async fn update_role_request_status(
        &self,
        request: &RoleRequest,
    ) -> Result<RoleRequest, Error> {
        let namespace = Self::namespace_of(request)?;
        // resourceVersion in a merge patch acts as a precondition
        let patch = json!({
            "metadata": { "resourceVersion": request.resource_version() },
            "status": request.status,
        });
        self.role_requests(&namespace)
            .patch_status(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| classify(e, "RoleRequest", ObjectKey::of(request).to_string()))
    }

    async fn delete_role_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.role_requests(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "RoleRequest", format!("{namespace}/{name}")))
    }

    fn watch_role_requests(&self) -> WatchStream<RoleRequest> {
        let api: Api<RoleRequest> = Api::all(self.client.clone());
        watcher::watcher(api, watch_config()).default_backoff().boxed()
    }

    fn watch_acceptable_use_policies(&self) -> WatchStream<AcceptableUsePolicy> {
        let api: Api<AcceptableUsePolicy> = Api::all(self.client.clone());
        watcher::watcher(api, watch_config()).default_backoff().boxed()
    }

    async fn get_acceptable_use_policy(&self, name: &str) -> Result<AcceptableUsePolicy, Error> {
        let api: Api<AcceptableUsePolicy> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| classify(e, "AcceptableUsePolicy", name))
    }

    async fn list_acceptable_use_policies(
        &self,
        label_selector: &str,
    ) -> Result<Vec<AcceptableUsePolicy>, Error> {
        let api: Api<AcceptableUsePolicy> = Api::all(self.client.clone());
        Ok(api.list(&list_params(label_selector)).await?.items)
    }

    async fn create_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error> {
        let api: Api<AcceptableUsePolicy> = Api::all(self.client.clone());
        api.create(&PostParams::default(), policy)
            .await
            .map_err(|e| classify(e, "AcceptableUsePolicy", policy.name_any()))
    }

    async fn update_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error> {
        let api: Api<AcceptableUsePolicy> = Api::all(self.client.clone());
        api.replace(&policy.name_any(), &PostParams::default(), policy)
            .await
            .map_err(|e| classify(e, "AcceptableUsePolicy", policy.name_any()))
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| classify(e, "Namespace", name))
    }

    async fn get_tenant(&self, name: &str) -> Result<Tenant, Error> {
        let api: Api<Tenant> = Api::all(self.client.clone());
        api.get(name).await.map_err(|e| classify(e, "Tenant", name))
    }

    async fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_cluster_roles(&self) -> Result<Vec<ClusterRole>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(label_selector)).await?.items)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let namespace = binding
            .namespace()
            .ok_or_else(|| Error::validation("RoleBinding has no namespace"))?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), binding)
            .await
            .map_err(|e| classify(e, "RoleBinding", ObjectKey::of(binding).to_string()))
    }

    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let namespace = binding
            .namespace()
            .ok_or_else(|| Error::validation("RoleBinding has no namespace"))?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await
            .map_err(|e| classify(e, "RoleBinding", ObjectKey::of(binding).to_string()))
    }

    async fn review_access(&self, review: &AccessReview) -> Result<bool, Error> {
        let sar = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(review.user.clone()),
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(review.namespace.clone()),
                    verb: Some(review.verb.clone()),
                    group: Some(review.group.clone()),
                    resource: Some(review.resource.clone()),
                    name: Some(review.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &sar).await?;
        Ok(response.status.map(|s| s.allowed).unwrap_or(false))
    }
}
