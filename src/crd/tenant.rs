//! Tenant Custom Resource Definition
//!
//! Tenants own namespaces through the `canopy.dev/tenant` and
//! `canopy.dev/tenant-uid` labels. The RoleRequest controller only reads them
//! to decide whether requests in a namespace are allowed to exist.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Tenant
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.canopy.dev",
    version = "v1alpha1",
    kind = "Tenant",
    plural = "tenants",
    printcolumn = r#"{"name":"Full Name","type":"string","jsonPath":".spec.fullName"}"#,
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Display name of the organization
    pub full_name: String,

    /// Short display name
    pub short_name: String,

    /// Organization website
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Administrative contact
    pub contact: TenantContact,

    /// Disabled tenants lose the right to hold role requests
    #[serde(default)]
    pub enabled: bool,
}

/// Administrative contact of a tenant
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantContact {
    /// Contact's first name
    pub first_name: String,
    /// Contact's last name
    pub last_name: String,
    /// Contact's email
    pub email: String,
}
