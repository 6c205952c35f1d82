//! RoleRequest approval state machine
//!
//! Steps run top to bottom and stop at the first one that decides the
//! request's fate:
//!
//! 1. stamp the expiry on first sight
//! 2. delete requests living in namespaces without a valid tenant
//! 3. fail requests naming a missing Role or ClusterRole
//! 4. link (adopt or create) the requester's AcceptableUsePolicy
//! 5. wait for the policy to be accepted
//! 6. wait for approval, notifying approvers once
//! 7. bind the role, issue credentials and tell the requester
//!
//! The machine mutates a private copy of the request. Only the RoleRequest
//! label update and the deletion are written here; the reconciler commits
//! the resulting status.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use rand::Rng;
use tracing::{debug, info, warn};

use super::messages;
use crate::controller::Context;
use crate::crd::{
    AcceptableUsePolicy, AcceptableUsePolicySpec, RoleKind, RoleRequest, RoleRequestState,
    RoleRequestStatus, AUTH_CLIENT_CERTIFICATE, AUTH_OIDC,
};
use crate::events::{actions, reasons};
use crate::notification::{Notification, NotificationKind};
use crate::permission::{approver_emails, namespace_access};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{
    Error, ACCEPTABLE_USE_POLICY_LABEL, CLUSTER_UID_LABEL, GENERATED_LABEL, GENERATED_SELECTOR,
};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Attempts for a RoleBinding write racing other workers
const BINDING_WRITE_ATTEMPTS: u32 = 5;

const POLICY_SUFFIX_LEN: usize = 6;
const POLICY_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// What the machine did with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Status holds the decision and must be committed if it changed
    Decided,
    /// The request was deleted; there is nothing left to write
    Deleted,
}

/// Run the approval steps against `request`.
///
/// `previous` is the status as it was before this reconcile started; the
/// approval gate uses it to avoid repeating the approver notification.
pub(crate) async fn evaluate(
    ctx: &Context,
    request: &mut RoleRequest,
    previous: Option<&RoleRequestStatus>,
) -> Result<Verdict, Error> {
    let namespace = request
        .namespace()
        .ok_or_else(|| Error::validation("RoleRequest has no namespace"))?;
    let name = request.name_any();

    // 1. expiry is stamped once and never moved
    let status = request.status.get_or_insert_with(RoleRequestStatus::default);
    if status.expiry.is_none() {
        let ttl = chrono::Duration::from_std(ctx.config.request_ttl)
            .map_err(|e| Error::validation(format!("request TTL out of range: {e}")))?;
        status.expiry = Some(ctx.clock.now() + ttl);
    }

    // 2. permission gate
    let access = namespace_access(ctx.store.as_ref(), &ctx.config.system_namespace, &namespace)
        .await?;
    if !access.permitted {
        info!(%namespace, request = %name, "namespace not permitted, deleting request");
        match ctx.store.delete_role_request(&namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        publish(ctx, request, EventType::Normal, reasons::DELETED, actions::DELETE, None).await;
        return Ok(Verdict::Deleted);
    }
    let cluster_uid = access.cluster_uid.unwrap_or_default();

    // 3. requested role must exist
    if !role_exists(ctx, request, &namespace).await? {
        set_status(request, RoleRequestState::Failure, messages::ROLE_NOT_FOUND);
        publish(
            ctx,
            request,
            EventType::Warning,
            reasons::NOT_FOUND,
            actions::CHECK_ROLE,
            Some(format!(
                "{} {} not found",
                request.spec.role_ref.kind, request.spec.role_ref.name
            )),
        )
        .await;
        return Ok(Verdict::Decided);
    }
    publish(ctx, request, EventType::Normal, reasons::FOUND, actions::CHECK_ROLE, None).await;

    // 4. acceptable use policy
    let Some(policy) = resolve_policy(ctx, request, &cluster_uid).await? else {
        set_status(request, RoleRequestState::Failure, messages::POLICY_CREATION_FAILED);
        publish(
            ctx,
            request,
            EventType::Warning,
            reasons::POLICY_CREATION_FAILED,
            actions::LINK_POLICY,
            Some(messages::POLICY_CREATION_FAILED.to_string()),
        )
        .await;
        return Ok(Verdict::Decided);
    };

    // 5. consent gate
    if !policy.spec.accepted {
        set_status(request, RoleRequestState::Pending, messages::POLICY_NOT_AGREED);
        publish(
            ctx,
            request,
            EventType::Normal,
            reasons::NOT_AGREED,
            actions::AWAIT,
            Some(format!("waiting for {} to accept policy {}", request.spec.email, policy.name_any())),
        )
        .await;
        return Ok(Verdict::Decided);
    }

    // 6. approval gate
    if !request.spec.approved {
        set_status(request, RoleRequestState::Pending, messages::ROLE_NOT_APPROVED);
        publish(
            ctx,
            request,
            EventType::Warning,
            reasons::NOT_APPROVED,
            actions::AWAIT,
            None,
        )
        .await;
        let already_waiting = previous
            .is_some_and(|s| s.is(RoleRequestState::Pending, messages::ROLE_NOT_APPROVED));
        if !already_waiting {
            notify_approvers(ctx, request, &namespace, &cluster_uid);
        }
        return Ok(Verdict::Decided);
    }

    // 7. approved
    set_status(request, RoleRequestState::Approved, messages::ROLE_APPROVED);
    publish(ctx, request, EventType::Normal, reasons::APPROVED, actions::BIND_ROLE, None).await;
    let snapshot: &RoleRequest = request;
    let bound = retry_with_backoff(
        &RetryConfig::with_max_attempts(BINDING_WRITE_ATTEMPTS),
        "ensure_role_binding",
        |e: &Error| e.is_conflict() || e.is_already_exists(),
        || ensure_role_binding(ctx, snapshot, &namespace),
    )
    .await;
    if let Err(e) = bound {
        warn!(%namespace, request = %name, error = %e, "failed to bind role");
        set_status(request, RoleRequestState::Failure, messages::BINDING_FAILED);
        publish(
            ctx,
            request,
            EventType::Warning,
            reasons::BINDING_FAILED,
            actions::BIND_ROLE,
            Some(e.to_string()),
        )
        .await;
        return Ok(Verdict::Decided);
    }

    let auth_methods = provision_credentials(ctx, request, &namespace).await;
    ctx.notifications.dispatch(Notification {
        kind: NotificationKind::RoleRequestApproved,
        namespace: namespace.clone(),
        cluster_uid,
        full_name: request.spec.full_name(),
        username: request.spec.email.clone(),
        role_request: name,
        recipients: vec![request.spec.email.clone()],
        auth_methods,
    });
    Ok(Verdict::Decided)
}

fn set_status(request: &mut RoleRequest, state: RoleRequestState, message: &str) {
    request
        .status
        .get_or_insert_with(RoleRequestStatus::default)
        .set(state, message);
}

async fn publish(
    ctx: &Context,
    request: &RoleRequest,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&request.object_ref(&()), type_, reason, action, note)
        .await;
}

async fn role_exists(ctx: &Context, request: &RoleRequest, namespace: &str) -> Result<bool, Error> {
    let wanted = &request.spec.role_ref.name;
    let exists = match request.spec.role_ref.kind {
        RoleKind::Role => ctx
            .store
            .list_roles(namespace)
            .await?
            .iter()
            .any(|r| &r.name_any() == wanted),
        RoleKind::ClusterRole => ctx
            .store
            .list_cluster_roles()
            .await?
            .iter()
            .any(|r| &r.name_any() == wanted),
    };
    Ok(exists)
}

/// Find or create the requester's policy and make sure the request links it.
///
/// Returns `None` when a policy had to be created and creation failed.
async fn resolve_policy(
    ctx: &Context,
    request: &mut RoleRequest,
    cluster_uid: &str,
) -> Result<Option<AcceptableUsePolicy>, Error> {
    if let Some(policy) = linked_policy(ctx, request).await? {
        return Ok(Some(policy));
    }

    let generated = ctx
        .store
        .list_acceptable_use_policies(GENERATED_SELECTOR)
        .await?;
    if let Some(policy) = generated
        .into_iter()
        .find(|p| p.spec.email == request.spec.email)
    {
        debug!(policy = %policy.name_any(), "adopting existing acceptable use policy");
        link_policy(ctx, request, &policy.name_any()).await?;
        return Ok(Some(policy));
    }

    let policy = new_policy(request, cluster_uid);
    match ctx.store.create_acceptable_use_policy(&policy).await {
        Ok(created) => {
            info!(policy = %created.name_any(), email = %request.spec.email, "created acceptable use policy");
            link_policy(ctx, request, &created.name_any()).await?;
            Ok(Some(created))
        }
        Err(e) => {
            warn!(policy = %policy.name_any(), error = %e, "failed to create acceptable use policy");
            Ok(None)
        }
    }
}

/// The labelled policy, if it exists and belongs to the requester
async fn linked_policy(
    ctx: &Context,
    request: &RoleRequest,
) -> Result<Option<AcceptableUsePolicy>, Error> {
    let Some(name) = request.policy_name() else {
        return Ok(None);
    };
    match ctx.store.get_acceptable_use_policy(name).await {
        Ok(policy) if policy.spec.email == request.spec.email => Ok(Some(policy)),
        Ok(_) => {
            debug!(policy = name, "linked policy belongs to another email");
            Ok(None)
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn new_policy(request: &RoleRequest, cluster_uid: &str) -> AcceptableUsePolicy {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..POLICY_SUFFIX_LEN)
        .map(|_| POLICY_SUFFIX_CHARS[rng.gen_range(0..POLICY_SUFFIX_CHARS.len())] as char)
        .collect();

    let mut labels = BTreeMap::from([(GENERATED_LABEL.to_string(), "true".to_string())]);
    if !cluster_uid.is_empty() {
        labels.insert(CLUSTER_UID_LABEL.to_string(), cluster_uid.to_string());
    }

    let mut policy = AcceptableUsePolicy::new(
        &format!("{}-{}", request.name_any(), suffix),
        AcceptableUsePolicySpec {
            email: request.spec.email.clone(),
            accepted: false,
        },
    );
    policy.metadata.labels = Some(labels);
    policy
}

/// Point the request's policy label at `policy`, keeping the in-progress status
async fn link_policy(ctx: &Context, request: &mut RoleRequest, policy: &str) -> Result<(), Error> {
    let mut labelled = request.clone();
    labelled
        .labels_mut()
        .insert(ACCEPTABLE_USE_POLICY_LABEL.to_string(), policy.to_string());

    let mut updated = ctx.store.update_role_request(&labelled).await?;
    updated.status = request.status.take();
    *request = updated;

    publish(
        ctx,
        request,
        EventType::Normal,
        reasons::UPDATED,
        actions::LINK_POLICY,
        Some(format!("linked acceptable use policy {policy}")),
    )
    .await;
    Ok(())
}

fn notify_approvers(ctx: &Context, request: &RoleRequest, namespace: &str, cluster_uid: &str) {
    let store = ctx.store.clone();
    let mut notification = Notification {
        kind: NotificationKind::RoleRequestPending,
        namespace: namespace.to_string(),
        cluster_uid: cluster_uid.to_string(),
        full_name: request.spec.full_name(),
        username: request.spec.email.clone(),
        role_request: request.name_any(),
        recipients: Vec::new(),
        auth_methods: Vec::new(),
    };

    ctx.notifications.spawn(async move {
        notification.recipients = approver_emails(
            store.as_ref(),
            &notification.namespace,
            &notification.role_request,
        )
        .await?;
        Ok((!notification.recipients.is_empty()).then_some(notification))
    });
}

/// Add the requester to the shared binding for the requested role, creating
/// the binding if needed. Runs against fresh state on every attempt.
async fn ensure_role_binding(
    ctx: &Context,
    request: &RoleRequest,
    namespace: &str,
) -> Result<(), Error> {
    let binding_name = request.spec.role_ref.binding_name();
    let email = &request.spec.email;

    let existing = ctx
        .store
        .list_role_bindings(namespace, GENERATED_SELECTOR)
        .await?
        .into_iter()
        .find(|b| b.name_any() == binding_name);

    match existing {
        Some(mut binding) => {
            let subjects = binding.subjects.get_or_insert_with(Vec::new);
            if subjects.iter().any(|s| s.kind == "User" && &s.name == email) {
                debug!(binding = %binding_name, %email, "subject already bound");
                return Ok(());
            }
            subjects.push(user_subject(email));
            ctx.store.update_role_binding(&binding).await?;
            info!(binding = %binding_name, %email, "added subject to role binding");
        }
        None => {
            let binding = RoleBinding {
                metadata: ObjectMeta {
                    name: Some(binding_name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(BTreeMap::from([(
                        GENERATED_LABEL.to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: request.spec.role_ref.kind.to_string(),
                    name: request.spec.role_ref.name.clone(),
                },
                subjects: Some(vec![user_subject(email)]),
            };
            ctx.store.create_role_binding(&binding).await?;
            info!(binding = %binding_name, %email, "created role binding");
        }
    }
    Ok(())
}

fn user_subject(email: &str) -> Subject {
    Subject {
        kind: "User".to_string(),
        name: email.to_string(),
        api_group: Some(RBAC_API_GROUP.to_string()),
        namespace: None,
    }
}

/// Provision every requested authentication method; returns the ones that
/// are ready. Failures are reported as Warning events and skipped.
async fn provision_credentials(
    ctx: &Context,
    request: &RoleRequest,
    namespace: &str,
) -> Vec<String> {
    let policy = request.policy_name().unwrap_or_default().to_string();
    let email = &request.spec.email;
    let mut ready = Vec::new();

    for method in &request.spec.authentication {
        let method = method.to_lowercase();
        match method.as_str() {
            AUTH_CLIENT_CERTIFICATE => {
                let certificate = match ctx
                    .credentials
                    .generate_client_certificate(namespace, &policy, email)
                    .await
                {
                    Ok(certificate) => certificate,
                    Err(e) => {
                        warn!(%email, error = %e, "client certificate generation failed");
                        publish(
                            ctx,
                            request,
                            EventType::Warning,
                            reasons::GENERATION_FAILED,
                            actions::ISSUE_CREDENTIALS,
                            Some(e.to_string()),
                        )
                        .await;
                        continue;
                    }
                };
                match ctx
                    .credentials
                    .make_kubeconfig(namespace, &policy, email, &certificate)
                    .await
                {
                    Ok(_) => ready.push(method.clone()),
                    Err(e) => {
                        warn!(%email, error = %e, "kubeconfig generation failed");
                        publish(
                            ctx,
                            request,
                            EventType::Warning,
                            reasons::KUBECONFIG_FAILED,
                            actions::ISSUE_CREDENTIALS,
                            Some(e.to_string()),
                        )
                        .await;
                    }
                }
            }
            AUTH_OIDC => ready.push(method.clone()),
            other => debug!(method = other, "ignoring unknown authentication method"),
        }
    }
    ready
}
