//! Namespace-keyed authorization synthesizer
//!
//! Each reconcile asks the API server who may administer, use and list
//! DBaaS resources in a namespace, then converges read-only grants:
//!
//! - per tenant claiming the namespace: a ClusterRole with `get` on the
//!   tenant, bound to service admins and developers who cannot already list
//!   tenants;
//! - per inventory: a Role with `get` on the inventory, bound to the
//!   inventory's declared users and groups, else those of its tenants.
//!
//! Role, RoleBinding, inventory and tenant events all map to the namespace
//! key, so bursts of changes coalesce into one reconcile.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use dbaas_common::crd::{DBaaSInventory, DBaaSTenant};
use dbaas_common::retry::BackoffTracker;
use dbaas_common::{Error, DBAAS_GROUP};

use crate::client::{AuthzKubeClient, AuthzKubeClientImpl};
use crate::rbac::{
    check_rules, inventory_role, inventory_role_binding, tenant_cluster_role,
    tenant_cluster_role_binding, INVENTORY_RESOURCE, TENANT_RESOURCE,
};
use crate::review::{AccessReviewer, KubeAccessReviewer, ResourceAttributes};
use crate::subjects::AccessSubjectSet;

/// Delay before retrying after an optimistic-concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Shared state for the authorization controller
pub struct AuthzContext {
    /// Kubernetes client (trait object for testability)
    pub kube: Arc<dyn AuthzKubeClient>,
    /// Access review queries
    pub reviewer: Arc<dyn AccessReviewer>,
    /// Per-namespace failure backoff
    pub backoff: BackoffTracker,
    /// Backstop requeue interval
    pub requeue_interval: Duration,
}

impl AuthzContext {
    /// Context backed by the real API server
    pub fn new(client: Client, field_manager: &str, requeue_interval: Duration) -> Self {
        Self {
            kube: Arc::new(AuthzKubeClientImpl::new(client.clone(), field_manager)),
            reviewer: Arc::new(KubeAccessReviewer::new(client)),
            backoff: BackoffTracker::default(),
            requeue_interval,
        }
    }

    /// Context with mock collaborators
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AuthzKubeClient>, reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self {
            kube,
            reviewer,
            backoff: BackoffTracker::default(),
            requeue_interval: Duration::from_secs(300),
        }
    }
}

/// Subjects to bind to one tenant's viewer ClusterRole
#[derive(Clone, Debug)]
pub struct TenantGrant {
    /// The tenant
    pub tenant: DBaaSTenant,
    /// Who should be able to read it
    pub subjects: AccessSubjectSet,
}

/// Subjects to bind to one inventory's viewer Role
#[derive(Clone, Debug)]
pub struct InventoryGrant {
    /// The inventory
    pub inventory: DBaaSInventory,
    /// Who should be able to read it
    pub subjects: AccessSubjectSet,
}

/// Every grant a namespace should carry
#[derive(Clone, Debug, Default)]
pub struct RoleArtifacts {
    /// One per tenant claiming the namespace
    pub tenants: Vec<TenantGrant>,
    /// One per inventory in the namespace
    pub inventories: Vec<InventoryGrant>,
}

/// Who may create both inventories and secrets in the namespace
async fn service_admins(namespace: &str, ctx: &AuthzContext) -> Result<AccessSubjectSet, Error> {
    let inventory_creators = ctx
        .reviewer
        .review(&ResourceAttributes::namespaced(
            "create",
            DBAAS_GROUP,
            INVENTORY_RESOURCE,
            namespace,
        ))
        .await?;
    let secret_creators = ctx
        .reviewer
        .review(&ResourceAttributes::namespaced("create", "", "secrets", namespace))
        .await?;
    Ok(inventory_creators.intersection(&secret_creators))
}

/// Who may list inventories, plus who may get each one by name
async fn developers(
    namespace: &str,
    inventories: &[DBaaSInventory],
    ctx: &AuthzContext,
) -> Result<AccessSubjectSet, Error> {
    let mut developers = ctx
        .reviewer
        .review(&ResourceAttributes::namespaced(
            "list",
            DBAAS_GROUP,
            INVENTORY_RESOURCE,
            namespace,
        ))
        .await?;
    for inventory in inventories {
        let readers = ctx
            .reviewer
            .review(
                &ResourceAttributes::namespaced("get", DBAAS_GROUP, INVENTORY_RESOURCE, namespace)
                    .named(&inventory.name_any()),
            )
            .await?;
        developers = developers.union(&readers);
    }
    Ok(developers)
}

/// Compute the grants for a namespace from live access reviews.
///
/// Reviews are skipped entirely when no tenant claims the namespace.
pub async fn synthesize_role_artifacts(
    namespace: &str,
    ctx: &AuthzContext,
) -> Result<RoleArtifacts, Error> {
    let inventories = ctx.kube.list_inventories(namespace).await?;
    let tenants = ctx.kube.list_tenants_for_namespace(namespace).await?;
    if tenants.len() > 1 {
        warn!(
            namespace = %namespace,
            tenants = ?tenants.iter().map(|t| t.name_any()).collect::<Vec<_>>(),
            "several tenants claim one inventory namespace"
        );
    }

    let mut artifacts = RoleArtifacts::default();

    if !tenants.is_empty() {
        let admins = service_admins(namespace, ctx).await?;
        let devs = developers(namespace, &inventories, ctx).await?;
        let tenant_listers = ctx
            .reviewer
            .review(&ResourceAttributes::cluster("list", DBAAS_GROUP, TENANT_RESOURCE))
            .await?;
        let subjects = admins.union(&devs).difference(&tenant_listers);
        debug!(
            namespace = %namespace,
            admins = admins.len(),
            developers = devs.len(),
            granted = subjects.len(),
            "tenant viewers derived"
        );
        artifacts.tenants = tenants
            .iter()
            .map(|tenant| TenantGrant {
                tenant: tenant.clone(),
                subjects: subjects.clone(),
            })
            .collect();
    }

    let tenant_defaults = tenants
        .iter()
        .map(|t| AccessSubjectSet::from_authz(&t.spec.authz))
        .fold(AccessSubjectSet::new(), |acc, s| acc.union(&s));

    artifacts.inventories = inventories
        .into_iter()
        .map(|inventory| {
            let subjects = match inventory.declared_authz() {
                Some(authz) => AccessSubjectSet::from_authz(authz),
                None => tenant_defaults.clone(),
            };
            InventoryGrant {
                inventory,
                subjects,
            }
        })
        .collect();

    Ok(artifacts)
}

/// Map a conflict to `true` so the caller can requeue
fn absorb_conflict(result: Result<(), Error>) -> Result<bool, Error> {
    match result {
        Ok(()) => Ok(false),
        Err(e) if e.is_conflict() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Converge a Role. `Ok(false)` means the safety gate refused its rules.
async fn converge_role(namespace: &str, desired: &Role, ctx: &AuthzContext) -> Result<bool, Error> {
    let name = desired.name_any();
    let rules = desired.rules.clone().unwrap_or_default();
    if let Err(e) = check_rules(&name, &rules) {
        error!(namespace = %namespace, role = %name, error = %e, "refusing to write role");
        return Ok(false);
    }

    match ctx.kube.get_role(namespace, &name).await? {
        None => {
            ctx.kube.create_role(namespace, desired).await?;
            info!(namespace = %namespace, role = %name, "created role");
        }
        Some(existing) if existing.rules.as_deref().unwrap_or_default() != rules.as_slice() => {
            ctx.kube
                .patch_role_rules(namespace, &name, existing.resource_version(), &rules)
                .await?;
            info!(namespace = %namespace, role = %name, "updated role rules");
        }
        Some(_) => {}
    }
    Ok(true)
}

async fn converge_role_binding(
    namespace: &str,
    desired: &RoleBinding,
    ctx: &AuthzContext,
) -> Result<(), Error> {
    let name = desired.name_any();
    let subjects = desired.subjects.clone().unwrap_or_default();

    match ctx.kube.get_role_binding(namespace, &name).await? {
        None => {
            ctx.kube.create_role_binding(namespace, desired).await?;
            info!(namespace = %namespace, binding = %name, "created role binding");
        }
        Some(existing) if existing.role_ref != desired.role_ref => {
            // roleRef is immutable
            ctx.kube.delete_role_binding(namespace, &name).await?;
            ctx.kube.create_role_binding(namespace, desired).await?;
            info!(namespace = %namespace, binding = %name, "recreated role binding");
        }
        Some(existing) if existing.subjects.as_deref().unwrap_or_default() != subjects.as_slice() => {
            ctx.kube
                .patch_role_binding_subjects(namespace, &name, existing.resource_version(), &subjects)
                .await?;
            info!(namespace = %namespace, binding = %name, subjects = subjects.len(), "updated role binding subjects");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Converge a ClusterRole. `Ok(false)` means the safety gate refused its rules.
async fn converge_cluster_role(desired: &ClusterRole, ctx: &AuthzContext) -> Result<bool, Error> {
    let name = desired.name_any();
    let rules = desired.rules.clone().unwrap_or_default();
    if let Err(e) = check_rules(&name, &rules) {
        error!(cluster_role = %name, error = %e, "refusing to write cluster role");
        return Ok(false);
    }

    match ctx.kube.get_cluster_role(&name).await? {
        None => {
            ctx.kube.create_cluster_role(desired).await?;
            info!(cluster_role = %name, "created cluster role");
        }
        Some(existing) if existing.rules.as_deref().unwrap_or_default() != rules.as_slice() => {
            ctx.kube
                .patch_cluster_role_rules(&name, existing.resource_version(), &rules)
                .await?;
            info!(cluster_role = %name, "updated cluster role rules");
        }
        Some(_) => {}
    }
    Ok(true)
}

async fn converge_cluster_role_binding(
    desired: &ClusterRoleBinding,
    ctx: &AuthzContext,
) -> Result<(), Error> {
    let name = desired.name_any();
    let subjects = desired.subjects.clone().unwrap_or_default();

    match ctx.kube.get_cluster_role_binding(&name).await? {
        None => {
            ctx.kube.create_cluster_role_binding(desired).await?;
            info!(binding = %name, "created cluster role binding");
        }
        Some(existing) if existing.role_ref != desired.role_ref => {
            ctx.kube.delete_cluster_role_binding(&name).await?;
            ctx.kube.create_cluster_role_binding(desired).await?;
            info!(binding = %name, "recreated cluster role binding");
        }
        Some(existing) if existing.subjects.as_deref().unwrap_or_default() != subjects.as_slice() => {
            ctx.kube
                .patch_cluster_role_binding_subjects(&name, existing.resource_version(), &subjects)
                .await?;
            info!(binding = %name, subjects = subjects.len(), "updated cluster role binding subjects");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Converge a tenant's ClusterRole, then its binding if the role was accepted
async fn converge_tenant_grant(
    role: &ClusterRole,
    binding: &ClusterRoleBinding,
    ctx: &AuthzContext,
) -> Result<(), Error> {
    if converge_cluster_role(role, ctx).await? {
        converge_cluster_role_binding(binding, ctx).await?;
    }
    Ok(())
}

/// Converge an inventory's Role, then its binding if the role was accepted
async fn converge_inventory_grant(
    namespace: &str,
    role: &Role,
    binding: &RoleBinding,
    ctx: &AuthzContext,
) -> Result<(), Error> {
    if converge_role(namespace, role, ctx).await? {
        converge_role_binding(namespace, binding, ctx).await?;
    }
    Ok(())
}

/// Converge every grant for a namespace
#[instrument(skip(ns, ctx), fields(namespace = %ns.name_any()))]
pub async fn reconcile(ns: Arc<Namespace>, ctx: Arc<AuthzContext>) -> Result<Action, Error> {
    let namespace = ns.name_any();
    if ns.metadata.deletion_timestamp.is_some() {
        debug!("namespace is terminating");
        return Ok(Action::await_change());
    }

    let artifacts = synthesize_role_artifacts(&namespace, &ctx).await?;
    let mut conflicted = false;

    for grant in &artifacts.tenants {
        let role = tenant_cluster_role(&grant.tenant)?;
        let binding = tenant_cluster_role_binding(&grant.tenant, &grant.subjects)?;
        conflicted |= absorb_conflict(converge_tenant_grant(&role, &binding, &ctx).await)?;
    }

    for grant in &artifacts.inventories {
        let role = inventory_role(&grant.inventory)?;
        let binding = inventory_role_binding(&grant.inventory, &grant.subjects)?;
        conflicted |=
            absorb_conflict(converge_inventory_grant(&namespace, &role, &binding, &ctx).await)?;
    }

    if conflicted {
        debug!("grant write conflict, requeueing");
        return Ok(Action::requeue(CONFLICT_REQUEUE));
    }

    ctx.backoff.reset(&namespace);
    Ok(Action::requeue(ctx.requeue_interval))
}

/// Requeue failed namespace reconciles with exponential backoff
pub fn error_policy(ns: Arc<Namespace>, error: &Error, ctx: Arc<AuthzContext>) -> Action {
    let namespace = ns.name_any();
    if !error.is_retryable() {
        warn!(
            namespace = %namespace,
            error = %error,
            "authorization reconciliation failed, waiting for a change"
        );
        return Action::requeue(ctx.requeue_interval);
    }
    let delay = ctx.backoff.next_delay(&namespace);
    warn!(
        namespace = %namespace,
        error = %error,
        retry_secs = delay.as_secs(),
        "authorization reconciliation failed"
    );
    Action::requeue(delay)
}

/// Namespace key for an inventory event
pub fn namespace_of_inventory(inventory: DBaaSInventory) -> Option<ObjectRef<Namespace>> {
    inventory.namespace().map(|ns| ObjectRef::new(&ns))
}

/// Namespace key for a tenant event: the namespace it claims
pub fn namespace_of_tenant(tenant: DBaaSTenant) -> Option<ObjectRef<Namespace>> {
    let ns = &tenant.spec.inventory_namespace;
    (!ns.is_empty()).then(|| ObjectRef::new(ns))
}

/// Namespace key for a namespaced RBAC object event.
///
/// Any Role or RoleBinding can change review answers, not only ours.
pub fn namespace_of_rbac<K: ResourceExt>(obj: K) -> Option<ObjectRef<Namespace>> {
    obj.namespace().map(|ns| ObjectRef::new(&ns))
}
