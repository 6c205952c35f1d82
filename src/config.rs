//! Controller configuration
//!
//! Every knob is a CLI flag with an environment variable fallback; the parsed
//! [`ControllerArgs`] is validated into a [`ControllerConfig`] that the rest of
//! the crate consumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::telemetry::LogFormat;
use crate::{
    Error, DEFAULT_MAX_RETRIES, DEFAULT_NOTIFICATION_CONCURRENCY, DEFAULT_REQUEST_TTL,
    DEFAULT_SYSTEM_NAMESPACE, DEFAULT_WORKERS,
};

/// Runtime settings for the RoleRequest controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of reconcile workers
    pub workers: usize,
    /// Rate-limited retries before a failing key is dropped
    pub max_retries: u32,
    /// Namespace whose UID identifies the local cluster
    pub system_namespace: String,
    /// Lifetime of a request from its first reconciliation
    pub request_ttl: Duration,
    /// Concurrent notification sends
    pub notification_concurrency: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            request_ttl: DEFAULT_REQUEST_TTL,
            notification_concurrency: DEFAULT_NOTIFICATION_CONCURRENCY,
        }
    }
}

impl ControllerConfig {
    /// Reject settings that would stall the controller
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::validation("workers must be at least 1"));
        }
        if self.notification_concurrency == 0 {
            return Err(Error::validation(
                "notification concurrency must be at least 1",
            ));
        }
        if self.request_ttl.is_zero() {
            return Err(Error::validation("request TTL must be positive"));
        }
        if self.system_namespace.is_empty() {
            return Err(Error::validation("system namespace must not be empty"));
        }
        Ok(())
    }
}

/// `canopy controller` arguments
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Number of reconcile workers
    #[arg(long, env = "CANOPY_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Requeues before a failing request is given up on
    #[arg(long, env = "CANOPY_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Namespace whose UID identifies this cluster
    #[arg(long, env = "CANOPY_SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Lifetime of a RoleRequest in hours
    #[arg(long, env = "CANOPY_REQUEST_TTL_HOURS", default_value_t = 72)]
    pub request_ttl_hours: u64,

    /// Concurrent notification sends
    #[arg(
        long,
        env = "CANOPY_NOTIFICATION_CONCURRENCY",
        default_value_t = DEFAULT_NOTIFICATION_CONCURRENCY
    )]
    pub notification_concurrency: usize,

    /// Apply the CRDs with server-side apply before starting
    #[arg(long, env = "CANOPY_INSTALL_CRDS")]
    pub install_crds: bool,

    /// PEM CA certificate used to sign client certificates
    #[arg(long, env = "CANOPY_CA_CERT", requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// PEM CA private key used to sign client certificates
    #[arg(long, env = "CANOPY_CA_KEY", requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// API server URL written into generated kubeconfigs
    #[arg(long, env = "CANOPY_API_SERVER", default_value = "https://kubernetes.default.svc")]
    pub api_server: String,

    /// Cluster name written into generated kubeconfigs
    #[arg(long, env = "CANOPY_CLUSTER_NAME", default_value = "canopy")]
    pub cluster_name: String,

    /// Directory receiving generated kubeconfig files
    #[arg(long, env = "CANOPY_KUBECONFIG_DIR", default_value = "kubeconfigs")]
    pub kubeconfig_dir: PathBuf,

    /// Log output format (text or json)
    #[arg(long, env = "CANOPY_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Build and validate the controller configuration
    pub fn controller_config(&self) -> Result<ControllerConfig, Error> {
        let config = ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            system_namespace: self.system_namespace.clone(),
            request_ttl: Duration::from_secs(self.request_ttl_hours * 60 * 60),
            notification_concurrency: self.notification_concurrency,
        };
        config.validate()?;
        Ok(config)
    }
}
