//! Custom Resource Definitions for Canopy
//!
//! This module contains all CRD definitions used by the RoleRequest controller.

mod acceptable_use_policy;
mod role_request;
mod tenant;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use acceptable_use_policy::{AcceptableUsePolicy, AcceptableUsePolicySpec};
pub use role_request::{
    RoleKind, RoleRequest, RoleRequestRef, RoleRequestSpec, RoleRequestState, RoleRequestStatus,
    AUTH_CLIENT_CERTIFICATE, AUTH_OIDC,
};
pub use tenant::{Tenant, TenantContact, TenantSpec};

/// Every CRD the controller depends on
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        RoleRequest::crd(),
        AcceptableUsePolicy::crd(),
        Tenant::crd(),
    ]
}
