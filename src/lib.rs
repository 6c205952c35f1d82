//! Canopy - multi-tenant RoleRequest controller
//!
//! Canopy watches `RoleRequest` custom resources and walks each one through an
//! approval workflow: tenant permission check, role existence check,
//! acceptable-use-policy consent, approver sign-off, and finally a RoleBinding
//! plus optional client credentials for the requester. Requests expire after a
//! fixed TTL and are reaped by a single deadline-driven scheduler.
//!
//! # Architecture
//!
//! - Every cluster interaction goes through the [`store::ObjectStore`] trait, so
//!   the whole controller runs unchanged against Kubernetes or an in-memory store
//! - A kube `Controller` over a reflector cache reconciles requests whose spec
//!   changed, and requests whose acceptable use policy was accepted
//! - Failed reconciles are requeued with per-request backoff
//! - Side effects that must never block a reconcile (notifications) run on a
//!   bounded task pool
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (RoleRequest, AcceptableUsePolicy, Tenant)
//! - [`controller`] - RoleRequest reconciler, approval state machine, expiry scheduler
//! - [`store`] - Object store abstraction with Kubernetes and in-memory backends
//! - [`retry`] - Retry, watch and requeue backoff
//! - [`permission`] - Tenant permission gate and approver discovery
//! - [`notification`] - Templated, fire-and-forget notifications
//! - [`credentials`] - Client certificate and kubeconfig issuance
//! - [`pki`] - Certificate authority operations
//! - [`events`] - Kubernetes event publishing
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod events;
pub mod notification;
pub mod permission;
pub mod pki;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels
// =============================================================================
// Label keys shared by the controller, the stores and the test fixtures.

/// Label on a RoleRequest naming its AcceptableUsePolicy
pub const ACCEPTABLE_USE_POLICY_LABEL: &str = "canopy.dev/acceptable-use-policy";

/// Label marking objects created by the controller itself
pub const GENERATED_LABEL: &str = "canopy.dev/generated";

/// Selector matching objects created by the controller
pub const GENERATED_SELECTOR: &str = "canopy.dev/generated=true";

/// Label on a namespace (or generated object) recording the owning cluster UID
pub const CLUSTER_UID_LABEL: &str = "canopy.dev/cluster-uid";

/// Label on a namespace naming the owning tenant
pub const TENANT_LABEL: &str = "canopy.dev/tenant";

/// Label on a namespace recording the owning tenant's UID
pub const TENANT_UID_LABEL: &str = "canopy.dev/tenant-uid";

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace whose UID identifies the local cluster
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Lifetime of a RoleRequest, counted from its first reconciliation
pub const DEFAULT_REQUEST_TTL: std::time::Duration = std::time::Duration::from_secs(72 * 60 * 60);

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of concurrently running notification sends
pub const DEFAULT_NOTIFICATION_CONCURRENCY: usize = 8;

/// Default number of rate-limited retries before a key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "canopy-controller";
