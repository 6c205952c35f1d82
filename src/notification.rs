//! Templated, fire-and-forget notifications
//!
//! The reconciler never waits on a notification. It hands a future that
//! builds the [`Notification`] to the [`NotificationDispatcher`], which runs it
//! on a bounded, tracked task pool and logs any failure.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use minijinja::Environment;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

const PENDING_BODY: &str = include_str!("../templates/role-request-notification.txt");
const APPROVED_BODY: &str = include_str!("../templates/role-request-approved.txt");

const PENDING_SUBJECT: &str = "[canopy] {{ full_name }} requests access to {{ namespace }}";
const APPROVED_SUBJECT: &str = "[canopy] Your role request {{ role_request }} was approved";

/// What a notification is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    /// A request waits for an approver
    RoleRequestPending,
    /// A request was approved and bound
    RoleRequestApproved,
}

impl NotificationKind {
    /// Template name of this kind
    pub fn template(&self) -> &'static str {
        match self {
            Self::RoleRequestPending => "role-request-notification",
            Self::RoleRequestApproved => "role-request-approved",
        }
    }
}

/// Data handed to the notification templates
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    /// What happened
    pub kind: NotificationKind,
    /// Namespace of the request
    pub namespace: String,
    /// Cluster the namespace belongs to
    pub cluster_uid: String,
    /// Requester's display name
    pub full_name: String,
    /// Requester's email
    pub username: String,
    /// Name of the RoleRequest
    pub role_request: String,
    /// Who receives the message
    pub recipients: Vec<String>,
    /// Authentication methods ready for the requester
    pub auth_methods: Vec<String>,
}

/// A rendered message
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedNotification {
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub body: String,
}

/// Renders notifications from the built-in templates
pub struct NotificationRenderer {
    env: Environment<'static>,
}

impl NotificationRenderer {
    /// Load the built-in templates
    pub fn new() -> Result<Self, Error> {
        let mut env = Environment::new();
        for (name, source) in [
            ("role-request-notification", PENDING_BODY),
            ("role-request-notification.subject", PENDING_SUBJECT),
            ("role-request-approved", APPROVED_BODY),
            ("role-request-approved.subject", APPROVED_SUBJECT),
        ] {
            env.add_template(name, source)
                .map_err(|e| Error::notification(format!("invalid template {name}: {e}")))?;
        }
        Ok(Self { env })
    }

    /// Render subject and body for `notification`
    pub fn render(&self, notification: &Notification) -> Result<RenderedNotification, Error> {
        let name = notification.kind.template();
        let render = |template: &str| {
            self.env
                .get_template(template)
                .and_then(|t| t.render(notification))
                .map_err(|e| Error::notification(format!("failed to render {template}: {e}")))
        };

        Ok(RenderedNotification {
            subject: render(&format!("{name}.subject"))?,
            body: render(name)?,
        })
    }
}

/// Delivers notifications
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification to its recipients
    async fn send(&self, notification: &Notification) -> Result<(), Error>;
}

/// Renders each notification and writes it to the log
pub struct LogNotifier {
    renderer: NotificationRenderer,
}

impl LogNotifier {
    /// Notifier using the built-in templates
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            renderer: NotificationRenderer::new()?,
        })
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), Error> {
        let rendered = self.renderer.render(notification)?;
        info!(
            kind = ?notification.kind,
            recipients = ?notification.recipients,
            subject = %rendered.subject,
            body = %rendered.body,
            "notification"
        );
        Ok(())
    }
}

/// Keeps sent notifications in memory, for tests and dry runs
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Everything sent so far
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Number of notifications of `kind` sent so far
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent.lock().iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), Error> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Runs notification work off the reconcile path on a bounded task pool
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl NotificationDispatcher {
    /// Dispatcher running at most `concurrency` sends at once
    pub fn new(notifier: Arc<dyn Notifier>, concurrency: usize) -> Self {
        Self {
            notifier,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Send a ready-made notification in the background
    pub fn dispatch(&self, notification: Notification) {
        self.spawn(async move { Ok(Some(notification)) });
    }

    /// Build and send a notification in the background.
    ///
    /// `build` resolving to `Ok(None)` means there is nobody to notify.
    pub fn spawn<F>(&self, build: F)
    where
        F: Future<Output = Result<Option<Notification>, Error>> + Send + 'static,
    {
        let notifier = self.notifier.clone();
        let permits = self.permits.clone();

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match build.await {
                Ok(Some(notification)) => {
                    if let Err(e) = notifier.send(&notification).await {
                        warn!(
                            kind = ?notification.kind,
                            role_request = %notification.role_request,
                            error = %e,
                            "failed to send notification"
                        );
                    }
                }
                Ok(None) => debug!("no recipients, notification skipped"),
                Err(e) => warn!(error = %e, "failed to prepare notification"),
            }
        });
    }

    /// Wait until every notification spawned so far has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of notification tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
