//! DBaaSPolicy arbitration controller
//!
//! Every reconcile re-derives the winner for the whole namespace and writes
//! `Ready` on each sibling, so the outcome does not depend on which policy
//! event triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use dbaas_common::crd::{
    reasons, set_condition, Condition, ConditionStatus, DBaaSPolicy, DBaaSPolicyStatus,
};
use dbaas_common::kube_utils::object_key;
use dbaas_common::retry::BackoffTracker;
use dbaas_common::{Error, FIELD_MANAGER};

use crate::resolver::{resolve_active_policy, sort_policies};

/// Delay before retrying after an optimistic-concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Kubernetes operations needed by the policy controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyKubeClient: Send + Sync {
    /// List every DBaaSPolicy in a namespace
    async fn list_policies(&self, namespace: &str) -> Result<Vec<DBaaSPolicy>, Error>;

    /// Write a policy's status, failing with 409 if `resource_version` is stale
    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &DBaaSPolicyStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct PolicyKubeClientImpl {
    client: Client,
    field_manager: String,
}

impl PolicyKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl PolicyKubeClient for PolicyKubeClientImpl {
    async fn list_policies(&self, namespace: &str) -> Result<Vec<DBaaSPolicy>, Error> {
        let api: Api<DBaaSPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &DBaaSPolicyStatus,
    ) -> Result<(), Error> {
        let api: Api<DBaaSPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status
        });
        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared state for the policy controller
pub struct PolicyContext {
    /// Kubernetes client (trait object for testability)
    pub kube: Arc<dyn PolicyKubeClient>,
    /// Per-policy failure backoff
    pub backoff: BackoffTracker,
    /// Backstop requeue interval
    pub requeue_interval: Duration,
}

impl PolicyContext {
    /// Context backed by the real API server
    pub fn new(client: Client, field_manager: &str, requeue_interval: Duration) -> Self {
        Self {
            kube: Arc::new(PolicyKubeClientImpl::new(client, field_manager)),
            backoff: BackoffTracker::default(),
            requeue_interval,
        }
    }

    /// Context with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn PolicyKubeClient>) -> Self {
        Self {
            kube,
            backoff: BackoffTracker::default(),
            requeue_interval: Duration::from_secs(300),
        }
    }
}

/// Map a policy event to every other policy in the same namespace.
///
/// A deleted active policy is never reconciled itself, so its siblings must
/// be woken to elect a successor.
pub fn sibling_policies(
    store: &Store<DBaaSPolicy>,
    policy: &DBaaSPolicy,
) -> Vec<ObjectRef<DBaaSPolicy>> {
    let namespace = policy.namespace();
    let name = policy.name_any();
    store
        .state()
        .iter()
        .filter(|p| p.namespace() == namespace && p.name_any() != name)
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .collect()
}

/// Desired `Ready` condition for a policy given the namespace's winner
fn ready_condition(is_winner: bool, winner: &str, namespace: &str) -> Condition {
    if is_winner {
        Condition::ready(
            ConditionStatus::True,
            reasons::READY,
            "policy is active for the namespace",
        )
    } else {
        Condition::ready(
            ConditionStatus::False,
            reasons::ACTIVE_POLICY_EXISTS,
            format!("policy {} is already active in namespace {}", winner, namespace),
        )
    }
}

/// Reconcile the policies of the namespace `policy` lives in
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any(), namespace = ?policy.namespace()))]
pub async fn reconcile(policy: Arc<DBaaSPolicy>, ctx: Arc<PolicyContext>) -> Result<Action, Error> {
    let name = policy.name_any();
    let namespace = policy
        .namespace()
        .ok_or_else(|| Error::validation(&name, "DBaaSPolicy must be namespaced"))?;

    let mut policies = ctx.kube.list_policies(&namespace).await?;
    sort_policies(&mut policies);

    let Some(winner) = resolve_active_policy(&policies).map(|p| p.name_any()) else {
        debug!("no policies remain in namespace");
        return Ok(Action::await_change());
    };

    for sibling in &policies {
        let sibling_name = sibling.name_any();
        let is_winner = sibling_name == winner;

        let mut status = sibling.status.clone().unwrap_or_default();
        let changed = set_condition(
            &mut status.conditions,
            ready_condition(is_winner, &winner, &namespace),
        );
        if !changed {
            continue;
        }

        match ctx
            .kube
            .patch_policy_status(&namespace, &sibling_name, sibling.resource_version(), &status)
            .await
        {
            Ok(()) => {
                if is_winner {
                    info!(active = %winner, "policy elected active");
                } else {
                    debug!(policy = %sibling_name, active = %winner, "policy marked inactive");
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(policy = %sibling_name, "status conflict, requeueing");
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            Err(e) if e.is_not_found() => {
                debug!(policy = %sibling_name, "policy deleted during arbitration");
            }
            Err(e) => return Err(e),
        }
    }

    ctx.backoff.reset(&object_key(Some(namespace.as_str()), &name));
    Ok(Action::requeue(ctx.requeue_interval))
}

/// Requeue failed policy reconciles with per-object exponential backoff
pub fn error_policy(policy: Arc<DBaaSPolicy>, error: &Error, ctx: Arc<PolicyContext>) -> Action {
    let key = object_key(policy.namespace().as_deref(), &policy.name_any());
    if !error.is_retryable() {
        warn!(policy = %key, error = %error, "policy reconciliation failed, waiting for a change");
        return Action::requeue(ctx.requeue_interval);
    }
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        policy = %key,
        error = %error,
        retry_secs = delay.as_secs(),
        "policy reconciliation failed"
    );
    Action::requeue(delay)
}
