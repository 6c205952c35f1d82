//! RoleRequest controller
//!
//! A reflector keeps every RoleRequest cached and kube's `Controller` drives
//! reconciles through the [approval](approval) state machine; the
//! [`ExpiryScheduler`] deletes requests whose expiry has passed.
//!
//! Only generation changes reach the reconciler, so the controller's own status
//! and label writes never trigger it. An accepted AcceptableUsePolicy
//! re-triggers every request linked to it. A request is never
//! reconciled by two workers at once. Transient failures are requeued with
//! per-request backoff until `max_retries` is reached.

mod approval;
mod expiry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use kube::runtime::controller::{Action, Config, Controller};
use kube::runtime::events::EventType;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{predicates, reflector, WatchStreamExt};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use approval::Verdict;
use crate::controller::Context;
use crate::crd::{AcceptableUsePolicy, RoleRequest, RoleRequestState};
use crate::events::{actions, reasons};
use crate::store::ObjectKey;
use crate::Error;

pub use expiry::ExpiryScheduler;

/// Status messages written by the approval state machine
pub mod messages {
    /// The requested Role or ClusterRole does not exist
    pub const ROLE_NOT_FOUND: &str = "role not found";
    /// No policy matched and creating one failed
    pub const POLICY_CREATION_FAILED: &str = "policy creation failed";
    /// The requester has not accepted the acceptable use policy
    pub const POLICY_NOT_AGREED: &str = "awaiting acceptable-use-policy agreement";
    /// Waiting for an approver to set `spec.approved`
    pub const ROLE_NOT_APPROVED: &str = "awaiting role approval";
    /// The role is bound
    pub const ROLE_APPROVED: &str = "role approved";
    /// The role binding could not be written
    pub const BINDING_FAILED: &str = "binding failed";
}

/// Runs the RoleRequest reconciler and the expiry scheduler
pub struct RoleRequestController {
    ctx: Arc<Context>,
    enqueued: mpsc::UnboundedSender<ObjectRef<RoleRequest>>,
    triggers: Mutex<Option<mpsc::UnboundedReceiver<ObjectRef<RoleRequest>>>>,
}

impl RoleRequestController {
    /// Controller watching every RoleRequest in `ctx.store`
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let (enqueued, triggers) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            enqueued,
            triggers: Mutex::new(Some(triggers)),
        })
    }

    /// The shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Queue `request` for reconciliation. Requests queued before
    /// [`run`](Self::run) are picked up once it starts.
    pub fn enqueue(&self, request: &RoleRequest) {
        if self.enqueued.send(ObjectRef::from_obj(request)).is_err() {
            debug!(request = %ObjectKey::of(request), "controller stopped, dropping enqueue");
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Reconciles wait for the first full listing of RoleRequests. At most
    /// `workers` reconciles run at once. On cancellation no new reconciles
    /// start, in-flight ones finish and pending notifications drain before
    /// this returns.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) -> Result<(), Error> {
        let triggers = self
            .triggers
            .lock()
            .take()
            .ok_or_else(|| Error::internal("RoleRequest controller is already running"))?;
        let ctx = self.ctx.clone();

        let (reader, writer) = reflector::store::<RoleRequest>();
        let requests = reflector(writer, ctx.store.watch_role_requests())
            .applied_objects()
            .predicate_filter(predicates::generation);
        let policies = ctx
            .store
            .watch_acceptable_use_policies()
            .applied_objects()
            .predicate_filter(predicates::generation);

        let tasks = TaskTracker::new();
        let scheduler = ExpiryScheduler::new(ctx.store.clone(), ctx.clock.clone())
            .with_events(ctx.events.clone());
        tasks.spawn(scheduler.run(cancel.child_token()));

        info!(workers, "starting RoleRequest controller");
        let linked = reader.clone();
        Controller::for_stream(requests, reader)
            .with_config(Config::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX)))
            .watches_stream(policies, move |policy: AcceptableUsePolicy| {
                if policy.spec.accepted {
                    linked_requests(&linked, &policy.name_any())
                } else {
                    Vec::new()
                }
            })
            .reconcile_on(UnboundedReceiverStream::new(triggers))
            .graceful_shutdown_on(cancel.clone().cancelled_owned())
            .run(reconcile, error_policy, ctx.clone())
            .for_each(|result| async move {
                match result {
                    Ok((request, _)) => debug!(%request, "reconciled"),
                    Err(kube::runtime::controller::Error::ObjectNotFound(request)) => {
                        debug!(%request, "RoleRequest no longer exists")
                    }
                    Err(kube::runtime::controller::Error::ReconcilerFailed(e, request)) => {
                        debug!(%request, error = %e, "reconcile failed")
                    }
                    Err(e) => warn!(error = %e, "RoleRequest controller error"),
                }
            })
            .await;

        info!("shutting down RoleRequest controller");
        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        ctx.notifications.wait_idle().await;
        info!("RoleRequest controller stopped");
        Ok(())
    }
}

/// Requests whose policy label names `policy`
fn linked_requests(requests: &Store<RoleRequest>, policy: &str) -> Vec<ObjectRef<RoleRequest>> {
    requests
        .state()
        .iter()
        .filter(|request| request.policy_name() == Some(policy))
        .map(|request| ObjectRef::from_obj(request.as_ref()))
        .collect()
}

/// Reconcile one RoleRequest.
///
/// Panics are caught and reported as internal errors so one bad object
/// cannot take the controller down.
pub async fn reconcile(request: Arc<RoleRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectKey::of(request.as_ref());
    let outcome = AssertUnwindSafe(sync(&request, &ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(Error::internal(format!(
                "reconcile panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    outcome.map(|()| {
        ctx.requeues.forget(&key);
        Action::await_change()
    })
}

/// Requeue transient failures with per-request backoff, drop the rest
pub fn error_policy(request: Arc<RoleRequest>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::of(request.as_ref());
    if !err.is_retryable() {
        error!(%key, error = %err, "dropping RoleRequest, error is not retryable");
        ctx.requeues.forget(&key);
        return Action::await_change();
    }

    let (failures, delay) = ctx.requeues.record_failure(&key);
    if failures > ctx.config.max_retries {
        error!(%key, error = %err, failures, "dropping RoleRequest after repeated failures");
        ctx.requeues.forget(&key);
        return Action::await_change();
    }
    warn!(%key, error = %err, failures, delay_ms = delay.as_millis(), "error syncing, requeuing");
    Action::requeue(delay)
}

#[instrument(skip_all, fields(request = %ObjectKey::of(cached)))]
async fn sync(cached: &RoleRequest, ctx: &Context) -> Result<(), Error> {
    if cached.state() != Some(RoleRequestState::Approved) {
        let mut request = cached.clone();
        let verdict = approval::evaluate(ctx, &mut request, cached.status.as_ref()).await?;

        if verdict == Verdict::Decided && request.status != cached.status {
            match ctx.store.update_role_request_status(&request).await {
                Ok(_) => debug!(status = ?request.status, "status updated"),
                Err(e) if e.is_not_found() => {
                    debug!("RoleRequest deleted before its status was written")
                }
                Err(e) => return Err(e),
            }
        }
    }

    ctx.events
        .publish(
            &cached.object_ref(&()),
            EventType::Normal,
            reasons::SYNCED,
            actions::RECONCILE,
            None,
        )
        .await;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
