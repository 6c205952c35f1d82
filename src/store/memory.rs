//! In-process [`ObjectStore`] with API-server-like semantics
//!
//! Every write bumps a global resource version and spec changes bump the
//! object's generation. Updates carrying a stale resource version fail with
//! [`Error::Conflict`], creates of an existing name fail with
//! [`Error::AlreadyExists`]. Watchers see the same `Init`, `InitApply`,
//! `InitDone` listing a kube watcher produces, then live events, and re-list
//! after a dropped connection. A handful of fault injection switches let tests
//! drive the controller's failure paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{selector_matches, AccessReview, ObjectKey, ObjectStore, WatchStream};
use crate::clock::{Clock, SystemClock};
use crate::crd::{AcceptableUsePolicy, RoleRequest, Tenant};
use crate::Error;

/// Counters of writes that reached the store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Successful RoleRequest status writes
    pub status_updates: usize,
    /// Successful RoleRequest deletions
    pub role_request_deletes: usize,
    /// Successful AcceptableUsePolicy creations
    pub policy_creates: usize,
    /// Successful RoleBinding creations
    pub binding_creates: usize,
}

/// Objects of one kind keyed by namespace/name, plus their watchers
struct Table<K> {
    kind: &'static str,
    items: BTreeMap<ObjectKey, K>,
    watchers: Vec<mpsc::UnboundedSender<Event<K>>>,
}

impl<K: Resource + Clone> Table<K> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: BTreeMap::new(),
            watchers: Vec::new(),
        }
    }

    fn get(&self, key: &ObjectKey) -> Result<K, Error> {
        self.items
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(self.kind, key.to_string()))
    }

    fn list(&self, namespace: Option<&str>, selector: &str) -> Vec<K> {
        self.items
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, obj)| selector_matches(obj.labels(), selector))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn create(&mut self, obj: &K, version: u64, now: &Time) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        if self.items.contains_key(&key) {
            return Err(Error::already_exists(self.kind, key.to_string()));
        }

        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.resource_version = Some(version.to_string());
        meta.generation = Some(1);
        meta.uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(now.clone());

        self.items.insert(key, stored.clone());
        self.broadcast(Event::Apply(stored.clone()));
        Ok(stored)
    }

    /// Check the caller's resource version against the stored one
    fn current(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let existing = self.get(&key)?;
        match obj.resource_version() {
            Some(rv) if Some(&rv) != existing.meta().resource_version.as_ref() => {
                Err(Error::conflict(self.kind, key.to_string()))
            }
            _ => Ok(existing),
        }
    }

    /// Store `obj` over the current copy; `spec_changed` moves the generation
    fn replace(&mut self, obj: &K, version: u64, spec_changed: bool) -> Result<K, Error> {
        let existing = self.current(obj)?;
        let generation = existing.meta().generation.unwrap_or(1);

        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.resource_version = Some(version.to_string());
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        meta.uid = existing.meta().uid.clone();
        meta.creation_timestamp = existing.meta().creation_timestamp.clone();

        self.items.insert(ObjectKey::of(obj), stored.clone());
        self.broadcast(Event::Apply(stored.clone()));
        Ok(stored)
    }

    fn remove(&mut self, key: &ObjectKey) -> Result<K, Error> {
        let removed = self
            .items
            .remove(key)
            .ok_or_else(|| Error::not_found(self.kind, key.to_string()))?;
        self.broadcast(Event::Delete(removed.clone()));
        Ok(removed)
    }

    fn broadcast(&mut self, event: Event<K>) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Open a feed primed with the current listing
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // receiver is alive, sends cannot fail
        let _ = tx.send(Event::Init);
        for obj in self.items.values() {
            let _ = tx.send(Event::InitApply(obj.clone()));
        }
        let _ = tx.send(Event::InitDone);
        self.watchers.push(tx);
        rx
    }
}

struct State {
    resource_version: u64,
    role_requests: Table<RoleRequest>,
    policies: Table<AcceptableUsePolicy>,
    namespaces: Table<Namespace>,
    tenants: Table<Tenant>,
    roles: Table<Role>,
    cluster_roles: Table<ClusterRole>,
    role_bindings: Table<RoleBinding>,
    access_grants: BTreeSet<(String, String)>,
    failing_watches: usize,
    binding_conflicts: usize,
    interleave_binding_writes: bool,
    reject_policy_creates: bool,
    stats: StoreStats,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.resource_version += 1;
        self.resource_version
    }
}

/// Kinds the store can serve watches for
trait Watched: Resource + Clone + Send + Sync + 'static {
    fn table(state: &mut State) -> &mut Table<Self>;
}

impl Watched for RoleRequest {
    fn table(state: &mut State) -> &mut Table<Self> {
        &mut state.role_requests
    }
}

impl Watched for AcceptableUsePolicy {
    fn table(state: &mut State) -> &mut Table<Self> {
        &mut state.policies
    }
}

fn subscribe<K: Watched>(
    state: &Mutex<State>,
) -> Result<mpsc::UnboundedReceiver<Event<K>>, watcher::Error> {
    let mut state = state.lock();
    if state.failing_watches > 0 {
        state.failing_watches -= 1;
        return Err(watcher::Error::WatchStartFailed(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "watch endpoint unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        })));
    }
    Ok(K::table(&mut state).subscribe())
}

/// Watch `K`, re-listing whenever the feed is dropped
fn watch<K: Watched>(state: Arc<Mutex<State>>) -> WatchStream<K> {
    stream::unfold((state, None), |(state, mut feed)| async move {
        loop {
            let mut rx = match feed.take() {
                Some(rx) => rx,
                None => match subscribe::<K>(&state) {
                    Ok(rx) => rx,
                    Err(e) => return Some((Err(e), (state, None))),
                },
            };
            if let Some(event) = rx.recv().await {
                return Some((Ok(event), (state, Some(rx))));
            }
        }
    })
    .default_backoff()
    .boxed()
}

/// In-memory object store
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Empty store stamping creation times from the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping creation times from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                resource_version: 0,
                role_requests: Table::new("RoleRequest"),
                policies: Table::new("AcceptableUsePolicy"),
                namespaces: Table::new("Namespace"),
                tenants: Table::new("Tenant"),
                roles: Table::new("Role"),
                cluster_roles: Table::new("ClusterRole"),
                role_bindings: Table::new("RoleBinding"),
                access_grants: BTreeSet::new(),
                failing_watches: 0,
                binding_conflicts: 0,
                interleave_binding_writes: false,
                reject_policy_creates: false,
                stats: StoreStats::default(),
            })),
            clock,
        }
    }

    fn now(&self) -> Time {
        Time(self.clock.now())
    }

    /// Seed a namespace
    pub fn add_namespace(&self, namespace: Namespace) -> Namespace {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        state
            .namespaces
            .create(&namespace, version, &now)
            .unwrap_or(namespace)
    }

    /// Seed (or replace) a tenant
    pub fn add_tenant(&self, tenant: Tenant) -> Tenant {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        let key = ObjectKey::of(&tenant);
        state.tenants.items.remove(&key);
        state
            .tenants
            .create(&tenant, version, &now)
            .unwrap_or(tenant)
    }

    /// Seed a Role
    pub fn add_role(&self, role: Role) -> Role {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        state.roles.create(&role, version, &now).unwrap_or(role)
    }

    /// Seed a ClusterRole
    pub fn add_cluster_role(&self, role: ClusterRole) -> ClusterRole {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        state
            .cluster_roles
            .create(&role, version, &now)
            .unwrap_or(role)
    }

    /// Seed a RoleBinding
    pub fn add_role_binding(&self, binding: RoleBinding) -> RoleBinding {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        state
            .role_bindings
            .create(&binding, version, &now)
            .unwrap_or(binding)
    }

    /// Let `user` pass every access review in `namespace`
    pub fn grant_access(&self, user: &str, namespace: &str) {
        self.state
            .lock()
            .access_grants
            .insert((user.to_string(), namespace.to_string()));
    }

    /// Fail the next `count` watch subscriptions
    pub fn fail_next_watches(&self, count: usize) {
        self.state.lock().failing_watches = count;
    }

    /// Drop every open watch connection; watchers re-list on their next poll
    pub fn close_watches(&self) {
        let mut state = self.state.lock();
        state.role_requests.watchers.clear();
        state.policies.watchers.clear();
    }

    /// Number of open RoleRequest watch connections
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.role_requests.watchers.retain(|tx| !tx.is_closed());
        state.role_requests.watchers.len()
    }

    /// Answer the next `count` RoleBinding writes with a conflict
    pub fn conflict_next_binding_writes(&self, count: usize) {
        self.state.lock().binding_conflicts = count;
    }

    /// Yield to the scheduler after every RoleBinding listing, so concurrent
    /// reconciles all read before any of them writes
    pub fn interleave_binding_writes(&self, interleave: bool) {
        self.state.lock().interleave_binding_writes = interleave;
    }

    /// Make AcceptableUsePolicy creation fail
    pub fn reject_policy_creates(&self, reject: bool) {
        self.state.lock().reject_policy_creates = reject;
    }

    /// Snapshot of the write counters
    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats.clone()
    }

    /// All RoleBindings in a namespace
    pub fn role_bindings(&self, namespace: &str) -> Vec<RoleBinding> {
        self.state.lock().role_bindings.list(Some(namespace), "")
    }

    fn take_binding_conflict(state: &mut State, binding: &RoleBinding) -> Result<(), Error> {
        if state.binding_conflicts > 0 {
            state.binding_conflicts -= 1;
            return Err(Error::conflict(
                "RoleBinding",
                ObjectKey::of(binding).to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_role_request(&self, namespace: &str, name: &str) -> Result<RoleRequest, Error> {
        self.state
            .lock()
            .role_requests
            .get(&ObjectKey::namespaced(namespace, name))
    }

    async fn list_role_requests(&self) -> Result<Vec<RoleRequest>, Error> {
        Ok(self.state.lock().role_requests.list(None, ""))
    }

    async fn create_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error> {
        let now = self.now();
        let mut state = self.state.lock();
        let version = state.next_version();
        state.role_requests.create(request, version, &now)
    }

    async fn update_role_request(&self, request: &RoleRequest) -> Result<RoleRequest, Error> {
        let mut state = self.state.lock();
        let existing = state.role_requests.current(request)?;

        let spec_changed = request.spec != existing.spec;
        let mut desired = request.clone();
        desired.status = existing.status;
        let version = state.next_version();
        state.role_requests.replace(&desired, version, spec_changed)
    }

    async fn update_role_request_status(
        &self,
        request: &RoleRequest,
    ) -> Result<RoleRequest, Error> {
        let mut state = self.state.lock();
        let mut desired = state.role_requests.current(request)?;
        desired.status = request.status.clone();

        let version = state.next_version();
        let updated = state.role_requests.replace(&desired, version, false)?;
        state.stats.status_updates += 1;
        Ok(updated)
    }

    async fn delete_role_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state
            .role_requests
            .remove(&ObjectKey::namespaced(namespace, name))?;
        state.stats.role_request_deletes += 1;
        Ok(())
    }

    fn watch_role_requests(&self) -> WatchStream<RoleRequest> {
        watch(self.state.clone())
    }

    fn watch_acceptable_use_policies(&self) -> WatchStream<AcceptableUsePolicy> {
        watch(self.state.clone())
    }

    async fn get_acceptable_use_policy(&self, name: &str) -> Result<AcceptableUsePolicy, Error> {
        self.state.lock().policies.get(&ObjectKey::cluster(name))
    }

    async fn list_acceptable_use_policies(
        &self,
        label_selector: &str,
    ) -> Result<Vec<AcceptableUsePolicy>, Error> {
        Ok(self.state.lock().policies.list(None, label_selector))
    }

    async fn create_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error> {
        let now = self.now();
        let mut state = self.state.lock();
        if state.reject_policy_creates {
            return Err(Error::internal("admission webhook denied the request"));
        }
        let version = state.next_version();
        let created = state.policies.create(policy, version, &now)?;
        state.stats.policy_creates += 1;
        Ok(created)
    }

    async fn update_acceptable_use_policy(
        &self,
        policy: &AcceptableUsePolicy,
    ) -> Result<AcceptableUsePolicy, Error> {
        let mut state = self.state.lock();
        let existing = state.policies.current(policy)?;
        let spec_changed = policy.spec != existing.spec;
        let version = state.next_version();
        state.policies.replace(policy, version, spec_changed)
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, Error> {
        self.state.lock().namespaces.get(&ObjectKey::cluster(name))
    }

    async fn get_tenant(&self, name: &str) -> Result<Tenant, Error> {
        self.state.lock().tenants.get(&ObjectKey::cluster(name))
    }

    async fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, Error> {
        Ok(self.state.lock().roles.list(Some(namespace), ""))
    }

    async fn list_cluster_roles(&self) -> Result<Vec<ClusterRole>, Error> {
        Ok(self.state.lock().cluster_roles.list(None, ""))
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, Error> {
        let (bindings, interleave) = {
            let state = self.state.lock();
            (
                state.role_bindings.list(Some(namespace), label_selector),
                state.interleave_binding_writes,
            )
        };
        if interleave {
            tokio::task::yield_now().await;
        }
        Ok(bindings)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let now = self.now();
        let mut state = self.state.lock();
        Self::take_binding_conflict(&mut state, binding)?;
        let version = state.next_version();
        let created = state.role_bindings.create(binding, version, &now)?;
        state.stats.binding_creates += 1;
        Ok(created)
    }

    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let mut state = self.state.lock();
        Self::take_binding_conflict(&mut state, binding)?;
        let version = state.next_version();
        state.role_bindings.replace(binding, version, false)
    }

    async fn review_access(&self, review: &AccessReview) -> Result<bool, Error> {
        Ok(self
            .state
            .lock()
            .access_grants
            .contains(&(review.user.clone(), review.namespace.clone())))
    }
}
