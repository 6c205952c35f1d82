//! Deadline-driven reaper for expired RoleRequests
//!
//! One loop holds a single armed deadline. Watch events carrying an earlier
//! expiry pull the deadline in; when it fires, every request is listed, the
//! expired ones are deleted and the deadline moves to the earliest survivor.
//! With nothing left to expire the deadline parks a year out.
//!
//! The initial listing of every (re)established watch also feeds the
//! deadline, so requests that expired while the controller was down are
//! reaped as soon as it starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::runtime::events::EventType;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::crd::RoleRequest;
use crate::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use crate::retry::{Backoff, RetryConfig};
use crate::store::{ObjectStore, WatchStream};

/// How far out an idle deadline is parked
const IDLE_HORIZON: chrono::Duration = chrono::Duration::days(365);

/// Re-check delay after a failed list or delete
const FIRE_RETRY: chrono::Duration = chrono::Duration::seconds(30);

/// Why a watch loop returned
enum WatchExit {
    Cancelled,
    StreamEnded,
}

/// Deletes RoleRequests once `status.expiry` has passed
pub struct ExpiryScheduler {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    restart: RetryConfig,
}

impl ExpiryScheduler {
    /// Scheduler over every RoleRequest in `store`
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            events: Arc::new(NoopEventPublisher),
            restart: RetryConfig::watch_restart(),
        }
    }

    /// Publish an `Expired` event for every reaped request
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Override the watch re-subscription backoff
    pub fn with_restart_backoff(mut self, restart: RetryConfig) -> Self {
        self.restart = restart;
        self
    }

    fn idle_deadline(&self) -> DateTime<Utc> {
        self.clock.now() + IDLE_HORIZON
    }

    /// Run until `cancel` fires, re-subscribing if the watch ever ends
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.restart.clone());
        let mut deadline = self.idle_deadline();

        loop {
            let stream = self.store.watch_role_requests();
            debug!(%deadline, "expiry watch started");
            match self.watch(stream, &mut deadline, &mut backoff, &cancel).await {
                WatchExit::Cancelled => return,
                WatchExit::StreamEnded => info!("expiry watch ended, re-subscribing"),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn watch(
        &self,
        mut stream: WatchStream<RoleRequest>,
        deadline: &mut DateTime<Utc>,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> WatchExit {
        loop {
            let wait = (*deadline - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => return WatchExit::Cancelled,
                _ = tokio::time::sleep(wait) => {
                    *deadline = self.reap().await;
                    debug!(%deadline, "next expiry armed");
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        backoff.reset();
                        if let Some(earliest) = earliest_expiry(&event) {
                            if earliest < *deadline {
                                *deadline = earliest;
                                debug!(%deadline, "expiry deadline moved earlier");
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "expiry watch error"),
                    None => return WatchExit::StreamEnded,
                },
            }
        }
    }

    /// Delete every expired request and return the next deadline
    async fn reap(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut next = self.idle_deadline();

        let requests = match self.store.list_role_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "failed to list RoleRequests for expiry");
                return now + FIRE_RETRY;
            }
        };

        for request in requests {
            let Some(expiry) = request.expiry() else {
                continue;
            };
            if expiry > now {
                next = next.min(expiry);
                continue;
            }

            let (namespace, name) = (request.namespace().unwrap_or_default(), request.name_any());
            match self.store.delete_role_request(&namespace, &name).await {
                Ok(()) => {
                    info!(%namespace, %name, %expiry, "deleted expired RoleRequest");
                    self.events
                        .publish(
                            &request.object_ref(&()),
                            EventType::Normal,
                            reasons::EXPIRED,
                            actions::DELETE,
                            Some(format!("expired at {}", expiry.to_rfc3339())),
                        )
                        .await;
                }
                Err(e) if e.is_not_found() => debug!(%namespace, %name, "expired RoleRequest already gone"),
                Err(e) => {
                    warn!(%namespace, %name, error = %e, "failed to delete expired RoleRequest");
                    next = next.min(now + FIRE_RETRY);
                }
            }
        }
        next
    }
}

fn earliest_expiry(event: &Event<RoleRequest>) -> Option<DateTime<Utc>> {
    match event {
        Event::Apply(request) | Event::InitApply(request) => request.expiry(),
        Event::Delete(_) | Event::Init | Event::InitDone => None,
    }
}
