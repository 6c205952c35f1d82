//! Controller implementations for Canopy CRDs
//!
//! The RoleRequest controller runs on kube's `Controller`: a reflector keeps
//! every request cached, spec changes and policy acceptance trigger
//! reconciles, and an independent scheduler reaps expired requests.

pub mod role_request;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::credentials::{CredentialIssuer, UnconfiguredCredentialIssuer};
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::notification::{LogNotifier, NotificationDispatcher, Notifier};
use crate::retry::RequeueLimiter;
use crate::store::{ObjectKey, ObjectStore};
use crate::Error;

pub use role_request::{error_policy, messages, reconcile, ExpiryScheduler, RoleRequestController};

/// Shared state for every reconcile
///
/// Collaborators are trait objects so the controller runs unchanged against
/// the API server or [`crate::store::InMemoryStore`].
///
/// ```ignore
/// let ctx = Context::builder(store)
///     .events(Arc::new(KubeEventPublisher::new(client, "canopy")))
///     .credentials(issuer)
///     .build()?;
/// ```
pub struct Context {
    /// Cluster object access
    pub store: Arc<dyn ObjectStore>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Background notification pool
    pub notifications: NotificationDispatcher,
    /// Client certificate and kubeconfig issuance
    pub credentials: Arc<dyn CredentialIssuer>,
    /// Wall clock for expiry timestamps
    pub clock: Arc<dyn Clock>,
    /// Runtime settings
    pub config: ControllerConfig,
    /// Failed reconciles per request, for requeue backoff
    pub requeues: RequeueLimiter<ObjectKey>,
}

impl Context {
    /// Create a builder around `store`
    pub fn builder(store: Arc<dyn ObjectStore>) -> ContextBuilder {
        ContextBuilder::new(store)
    }
}

/// Builder for [`Context`]
///
/// Unset collaborators default to: no events, log-only notifications, an
/// issuer without a CA, and the system clock.
pub struct ContextBuilder {
    store: Arc<dyn ObjectStore>,
    events: Option<Arc<dyn EventPublisher>>,
    notifier: Option<Arc<dyn Notifier>>,
    credentials: Option<Arc<dyn CredentialIssuer>>,
    clock: Option<Arc<dyn Clock>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            events: None,
            notifier: None,
            credentials: None,
            clock: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the notifier
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the credential issuer
    pub fn credentials(mut self, credentials: Arc<dyn CredentialIssuer>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the clock (paused-time tests use [`crate::clock::TokioClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the runtime settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the settings and build the Context
    pub fn build(self) -> Result<Context, Error> {
        self.config.validate()?;

        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(LogNotifier::new()?),
        };

        Ok(Context {
            store: self.store,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            notifications: NotificationDispatcher::new(
                notifier,
                self.config.notification_concurrency,
            ),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(UnconfiguredCredentialIssuer)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            requeues: RequeueLimiter::default(),
        })
    }
}
