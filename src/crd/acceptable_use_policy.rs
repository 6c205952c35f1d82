//! AcceptableUsePolicy Custom Resource Definition
//!
//! A per-email consent record. Role grants wait until the requester's policy is
//! accepted. The controller auto-creates one when none exists for an email.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an AcceptableUsePolicy
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.canopy.dev",
    version = "v1alpha1",
    kind = "AcceptableUsePolicy",
    plural = "acceptableusepolicies",
    shortname = "aup",
    printcolumn = r#"{"name":"Email","type":"string","jsonPath":".spec.email"}"#,
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".spec.accepted"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AcceptableUsePolicySpec {
    /// Email of the user this consent belongs to (matched case-sensitively)
    pub email: String,

    /// Whether the user agreed to the policy
    #[serde(default)]
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = AcceptableUsePolicy::crd();
        assert_eq!(crd.spec.group, "core.canopy.dev");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "acceptableusepolicies");
    }

    #[test]
    fn accepted_defaults_to_false() {
        let spec: AcceptableUsePolicySpec =
            serde_yaml::from_str("email: ada@example.org").unwrap();
        assert!(!spec.accepted);
    }
}
