//! Generic facade reconciler
//!
//! One reconcile function serves all three facade kinds:
//!
//! 1. Connections and instances are gated on their inventory: it must exist,
//!    be ready, and its effective policy must admit the facade.
//! 2. The provider registration names the backend kind for the facade's role.
//! 3. The backend kind is watched so backend status changes re-trigger us.
//! 4. The backend object is created, or replaced when its spec drifted.
//! 5. The backend's status is decoded into the facade's typed status and
//!    written back only when it changed.
//!
//! Every write carries a resourceVersion; 409 conflicts requeue quickly and
//! are never reported as failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use dbaas_common::crd::{
    reasons, set_condition, Condition, ConditionStatus, FacadeKind, NamespacedRef,
};
use dbaas_common::kube_utils::{controller_owner, controller_owner_ref, object_key};
use dbaas_common::retry::BackoffTracker;
use dbaas_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_DBAAS};
use dbaas_policy::{resolve_active_policy, resolve_effective_policy};

use crate::client::ProxyKubeClient;
use crate::facade::Facade;
use crate::registry::ProviderRegistry;
use crate::watch::WatchRegistrar;

/// Delay before retrying after an optimistic-concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Delay before re-checking an inventory that is not ready yet
const INVENTORY_NOT_READY_REQUEUE: Duration = Duration::from_secs(30);

/// Shared state for one facade controller
pub struct ProxyContext<F: Facade> {
    /// Kubernetes client (trait object for testability)
    pub kube: Arc<dyn ProxyKubeClient>,
    /// Provider and backend kind resolution, shared across facade kinds
    pub registry: Arc<ProviderRegistry>,
    /// Backend watches owned by this controller
    pub watches: Arc<WatchRegistrar<F>>,
    /// Per-facade failure backoff
    pub backoff: BackoffTracker,
    /// Backstop requeue interval
    pub requeue_interval: Duration,
}

impl<F: Facade> ProxyContext<F> {
    /// Assemble a context
    pub fn new(
        kube: Arc<dyn ProxyKubeClient>,
        registry: Arc<ProviderRegistry>,
        watches: Arc<WatchRegistrar<F>>,
        requeue_interval: Duration,
    ) -> Self {
        Self {
            kube,
            registry,
            watches,
            backoff: BackoffTracker::default(),
            requeue_interval,
        }
    }
}

/// Outcome of the inventory gate
enum Gate {
    /// Continue with the named provider
    Proceed(String),
    /// Stop, record `Ready=False` with this condition and return the outcome
    Blocked(Condition, Result<Action, Error>),
}

fn not_ready(reason: &str, message: impl Into<String>) -> Condition {
    Condition::ready(ConditionStatus::False, reason, message)
}

/// Reconcile a facade against its provider backend
#[instrument(
    skip(facade, ctx),
    fields(kind = %F::kind(&()), name = %facade.name_any(), namespace = ?facade.namespace())
)]
pub async fn reconcile<F: Facade>(facade: Arc<F>, ctx: Arc<ProxyContext<F>>) -> Result<Action, Error> {
    let name = facade.name_any();
    let namespace = facade
        .namespace()
        .ok_or_else(|| Error::validation(&name, "facade must be namespaced"))?;
    let key = object_key(Some(namespace.as_str()), &name);

    let gate = match (facade.provider_ref(), facade.inventory_ref()) {
        (Some(provider), _) => Gate::Proceed(provider.name.clone()),
        (None, Some(inventory)) => gate_on_inventory::<F>(inventory, &namespace, &ctx).await?,
        (None, None) => {
            return Err(Error::validation(&key, "facade names neither a provider nor an inventory"))
        }
    };
    let provider_name = match gate {
        Gate::Proceed(provider) => provider,
        Gate::Blocked(condition, outcome) => {
            debug!(reason = %condition.reason, "facade blocked by inventory gate");
            write_ready_condition(&*facade, &ctx, condition).await?;
            return outcome;
        }
    };

    let provider = match ctx.registry.provider(&provider_name, &key).await {
        Ok(provider) => provider,
        Err(e @ Error::ProviderNotFound { .. }) => {
            warn!(provider = %provider_name, "provider is not registered");
            write_ready_condition(
                &*facade,
                &ctx,
                not_ready(reasons::PROVIDER_NOT_FOUND, e.to_string()),
            )
            .await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let ar = ctx.registry.backend_resource(&provider, F::ROLE).await?;
    ctx.watches.ensure_watch(&provider.registered_name(), &ar);

    let desired_spec = facade.spec_value()?;
    let Some(backend) = sync_backend(&*facade, &ar, &namespace, desired_spec, &ctx).await? else {
        return Ok(Action::requeue(CONFLICT_REQUEUE));
    };

    let status = derive_status(&*facade, &backend)?;
    if facade.status() != Some(&status) {
        match patch_status(&*facade, &ctx, &status).await {
            Ok(()) => debug!("facade status updated from backend"),
            Err(e) if e.is_conflict() => {
                debug!("facade status conflict, requeueing");
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            Err(e) => return Err(e),
        }
    }

    ctx.backoff.reset(&key);
    Ok(Action::requeue(ctx.requeue_interval))
}

/// Check the inventory a connection or instance depends on
async fn gate_on_inventory<F: Facade>(
    inventory_ref: &NamespacedRef,
    namespace: &str,
    ctx: &ProxyContext<F>,
) -> Result<Gate, Error> {
    let inventory_ns = inventory_ref.namespace_or(namespace);
    let Some(inventory) = ctx
        .kube
        .get_inventory(inventory_ns, &inventory_ref.name)
        .await?
    else {
        let err = Error::inventory_not_found(&inventory_ref.name, inventory_ns);
        return Ok(Gate::Blocked(
            not_ready(reasons::INVENTORY_NOT_FOUND, err.to_string()),
            Err(err),
        ));
    };

    if !inventory.is_ready() {
        return Ok(Gate::Blocked(
            not_ready(
                reasons::INVENTORY_NOT_READY,
                format!("inventory {}/{} is not ready", inventory_ns, inventory_ref.name),
            ),
            Ok(Action::requeue(INVENTORY_NOT_READY_REQUEUE)),
        ));
    }

    let policies = ctx.kube.list_policies(inventory_ns).await?;
    let effective = resolve_effective_policy(&inventory, resolve_active_policy(&policies));

    let labels = if effective.needs_namespace_labels(inventory_ns, namespace) {
        ctx.kube.namespace_labels(namespace).await?
    } else {
        BTreeMap::new()
    };
    if !effective.is_namespace_allowed(inventory_ns, namespace, &labels) {
        return Ok(Gate::Blocked(
            not_ready(
                reasons::INVALID_CONNECTION_NAMESPACE,
                format!(
                    "namespace {} is not allowed to use inventory {}/{}",
                    namespace, inventory_ns, inventory_ref.name
                ),
            ),
            Ok(Action::requeue(ctx.requeue_interval)),
        ));
    }

    if F::ROLE == FacadeKind::Instance && effective.disable_provisions {
        return Ok(Gate::Blocked(
            not_ready(
                reasons::INVENTORY_NOT_PROVISIONABLE,
                format!(
                    "provisioning is disabled for inventory {}/{}",
                    inventory_ns, inventory_ref.name
                ),
            ),
            Ok(Action::requeue(ctx.requeue_interval)),
        ));
    }

    Ok(Gate::Proceed(inventory.spec.provider_ref.name.clone()))
}

/// Build a new backend object mirroring the facade
pub fn build_backend<F: Facade>(
    facade: &F,
    ar: &ApiResource,
    spec: serde_json::Value,
) -> Result<DynamicObject, Error> {
    let name = facade.name_any();
    let owner = controller_owner_ref(facade)?;

    let mut obj = DynamicObject::new(&name, ar);
    obj.metadata.namespace = facade.namespace();
    obj.metadata.owner_references = Some(vec![owner]);
    obj.metadata.labels = Some(BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_DBAAS.to_string(),
    )]));
    obj.data = serde_json::json!({ "spec": spec });
    Ok(obj)
}

fn set_spec(obj: &mut DynamicObject, spec: serde_json::Value) {
    match obj.data.as_object_mut() {
        Some(map) => {
            map.insert("spec".to_string(), spec);
        }
        None => obj.data = serde_json::json!({ "spec": spec }),
    }
}

/// Refuse to adopt a backend another object controls
fn verify_owner<F: Facade>(facade: &F, backend: &DynamicObject) -> Result<(), Error> {
    let uid = facade.meta().uid.as_deref();
    let resource = object_key(backend.metadata.namespace.as_deref(), &backend.name_any());
    match controller_owner(backend) {
        Some(owner) if Some(owner.uid.as_str()) == uid => Ok(()),
        Some(owner) => Err(Error::validation(
            resource,
            format!("backend is controlled by {} {}", owner.kind, owner.name),
        )),
        None => Err(Error::validation(
            resource,
            "backend exists without a controller owner",
        )),
    }
}

/// Create or update the backend. `None` means a conflict occurred.
async fn sync_backend<F: Facade>(
    facade: &F,
    ar: &ApiResource,
    namespace: &str,
    desired_spec: serde_json::Value,
    ctx: &ProxyContext<F>,
) -> Result<Option<DynamicObject>, Error> {
    let name = facade.name_any();

    let Some(current) = ctx.kube.get_backend(ar, namespace, &name).await? else {
        let obj = build_backend(facade, ar, desired_spec)?;
        return match ctx.kube.create_backend(ar, namespace, &obj).await {
            Ok(created) => {
                info!(backend_kind = %ar.kind, "created backend");
                Ok(Some(created))
            }
            Err(e) if e.is_conflict() => {
                debug!(backend_kind = %ar.kind, "backend created concurrently");
                Ok(None)
            }
            Err(e) => Err(e),
        };
    };

    verify_owner(facade, &current)?;

    if current.data.get("spec") == Some(&desired_spec) {
        return Ok(Some(current));
    }

    let mut updated = current;
    set_spec(&mut updated, desired_spec);
    match ctx.kube.replace_backend(ar, namespace, &updated).await {
        Ok(replaced) => {
            info!(backend_kind = %ar.kind, "backend spec updated");
            Ok(Some(replaced))
        }
        Err(e) if e.is_conflict() => {
            debug!(backend_kind = %ar.kind, "backend replace conflict");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Facade status implied by the backend's status.
///
/// Backend conditions pass through verbatim; ones without a transition time
/// keep the facade's previous time while their status holds.
pub fn derive_status<F: Facade>(facade: &F, backend: &DynamicObject) -> Result<F::Status, Error> {
    let mut previous = facade.status().cloned().unwrap_or_default();

    let Some(raw) = backend.data.get("status").filter(|s| !s.is_null()) else {
        set_condition(
            F::conditions_mut(&mut previous),
            Condition::ready(
                ConditionStatus::Unknown,
                reasons::BACKEND_PENDING,
                "waiting for the provider to report status",
            ),
        );
        return Ok(previous);
    };

    let mut status: F::Status = serde_json::from_value(raw.clone())
        .map_err(|e| Error::serialization_for_kind(F::kind(&()), e.to_string()))?;

    let prior = std::mem::take(F::conditions_mut(&mut previous));
    for condition in F::conditions_mut(&mut status).iter_mut() {
        if condition.last_transition_time.is_none() {
            condition.last_transition_time = prior
                .iter()
                .find(|p| p.type_ == condition.type_ && p.status == condition.status)
                .and_then(|p| p.last_transition_time)
                .or_else(|| Some(chrono::Utc::now()));
        }
    }
    Ok(status)
}

/// RFC 7386 merge patch turning `stored` into `desired`.
///
/// Keys present in `stored` but missing from `desired` become explicit
/// `null`s so the API server drops them; nested objects are diffed
/// recursively and every other value is sent whole.
pub fn merge_patch(stored: &serde_json::Value, desired: &serde_json::Value) -> serde_json::Value {
    match (stored.as_object(), desired.as_object()) {
        (Some(stored), Some(desired)) => {
            let mut patch = serde_json::Map::new();
            for key in stored.keys().filter(|k| !desired.contains_key(*k)) {
                patch.insert(key.clone(), serde_json::Value::Null);
            }
            for (key, value) in desired {
                let entry = match stored.get(key) {
                    Some(prior) if prior == value => continue,
                    Some(prior) => merge_patch(prior, value),
                    None => value.clone(),
                };
                patch.insert(key.clone(), entry);
            }
            serde_json::Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

async fn patch_status<F: Facade>(
    facade: &F,
    ctx: &ProxyContext<F>,
    status: &F::Status,
) -> Result<(), Error> {
    let stored = match facade.status() {
        Some(stored) => serde_json::to_value(stored)?,
        None => serde_json::Value::Null,
    };
    let value = merge_patch(&stored, &serde_json::to_value(status)?);
    let namespace = facade.namespace().unwrap_or_default();
    ctx.kube
        .patch_facade_status(
            &ApiResource::erase::<F>(&()),
            &namespace,
            &facade.name_any(),
            facade.resource_version(),
            &value,
        )
        .await
}

/// Record a `Ready` condition on the facade if it changed
async fn write_ready_condition<F: Facade>(
    facade: &F,
    ctx: &ProxyContext<F>,
    condition: Condition,
) -> Result<(), Error> {
    let mut status = facade.status().cloned().unwrap_or_default();
    if !set_condition(F::conditions_mut(&mut status), condition) {
        return Ok(());
    }
    match patch_status(facade, ctx, &status).await {
        Err(e) if e.is_conflict() => {
            debug!("condition write conflict, the next reconcile retries");
            Ok(())
        }
        other => other,
    }
}

/// Requeue failed facade reconciles with per-object exponential backoff.
///
/// Errors that need a spec change to clear wait for the backstop interval.
pub fn error_policy<F: Facade>(facade: Arc<F>, error: &Error, ctx: Arc<ProxyContext<F>>) -> Action {
    let key = object_key(facade.namespace().as_deref(), &facade.name_any());
    if !error.is_retryable() {
        warn!(
            kind = %F::kind(&()),
            resource = %key,
            error = %error,
            "facade reconciliation failed, waiting for a change"
        );
        return Action::requeue(ctx.requeue_interval);
    }
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        kind = %F::kind(&()),
        resource = %key,
        error = %error,
        retry_secs = delay.as_secs(),
        "facade reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use dbaas_common::crd::{
        find_condition, DBaaSConnection, DBaaSConnectionSpec, DBaaSInstance, DBaaSInstanceSpec,
        DBaaSInventory, DBaaSInventorySpec, DBaaSInventoryStatus, DBaaSPolicy, DBaaSPolicySpec,
        DBaaSProvider, DBaaSProviderSpec, InventoryPolicy, LocalObjectRef, ProviderInfo,
        ProviderRef, CONDITION_READY,
    };
    use kube::runtime::reflector::ObjectRef;
    use tokio::sync::mpsc;

    use crate::client::MockProxyKubeClient;
    use crate::watch::Spawner;

    const BACKEND_GV: &str = "crunchy.example.com/v1alpha1";

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn provider() -> DBaaSProvider {
        DBaaSProvider::new(
            "crunchy-registration",
            DBaaSProviderSpec {
                provider: ProviderInfo {
                    name: "crunchy".to_string(),
                    ..Default::default()
                },
                group_version: Some(BACKEND_GV.to_string()),
                inventory_kind: "CrunchyInventory".to_string(),
                connection_kind: "CrunchyConnection".to_string(),
                instance_kind: "CrunchyInstance".to_string(),
                credential_fields: vec![],
                instance_parameter_specs: vec![],
            },
        )
    }

    fn inventory(ready: bool, overrides: InventoryPolicy) -> DBaaSInventory {
        let mut inv = DBaaSInventory::new(
            "inv1",
            DBaaSInventorySpec {
                provider_ref: ProviderRef {
                    name: "crunchy".to_string(),
                },
                credentials_ref: LocalObjectRef {
                    name: "creds".to_string(),
                },
                authz: None,
                policy: overrides,
            },
        );
        inv.metadata.namespace = Some("inv-ns".to_string());
        inv.metadata.uid = Some("inv-uid".to_string());
        inv.metadata.resource_version = Some("10".to_string());
        if ready {
            inv.status = Some(DBaaSInventoryStatus {
                conditions: vec![Condition::ready(ConditionStatus::True, "SyncOK", "")],
                database_services: vec![],
            });
        }
        inv
    }

    fn connection(namespace: &str) -> DBaaSConnection {
        let mut conn = DBaaSConnection::new(
            "orders",
            DBaaSConnectionSpec {
                inventory_ref: NamespacedRef {
                    name: "inv1".to_string(),
                    namespace: Some("inv-ns".to_string()),
                },
                database_service_id: "svc-1".to_string(),
                database_service_name: None,
                database_service_type: None,
            },
        );
        conn.metadata.namespace = Some(namespace.to_string());
        conn.metadata.uid = Some("conn-uid".to_string());
        conn
    }

    fn instance() -> DBaaSInstance {
        let mut inst = DBaaSInstance::new(
            "orders-db",
            DBaaSInstanceSpec {
                inventory_ref: NamespacedRef {
                    name: "inv1".to_string(),
                    namespace: None,
                },
                name: "orders-db".to_string(),
                cloud_provider: Some("aws".to_string()),
                cloud_region: Some("us-east-1".to_string()),
                other_instance_params: BTreeMap::new(),
            },
        );
        inst.metadata.namespace = Some("inv-ns".to_string());
        inst.metadata.uid = Some("inst-uid".to_string());
        inst
    }

    fn policy(spec: InventoryPolicy) -> DBaaSPolicy {
        let mut p = DBaaSPolicy::new("default", DBaaSPolicySpec { policy: spec });
        p.metadata.namespace = Some("inv-ns".to_string());
        p
    }

    /// Backend as the provider would return it, owned by `facade`
    fn backend_for<F: Facade>(facade: &F, kind: &str, status: Option<serde_json::Value>) -> DynamicObject {
        let ar = dbaas_common::kube_utils::build_api_resource(BACKEND_GV, kind);
        let mut obj = build_backend(facade, &ar, facade.spec_value().unwrap()).unwrap();
        obj.metadata.resource_version = Some("7".to_string());
        if let Some(status) = status {
            obj.data["status"] = status;
        }
        obj
    }

    /// Records facade status writes
    #[derive(Clone, Default)]
    struct StatusCapture {
        writes: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
    }

    impl StatusCapture {
        fn install(&self, mock: &mut MockProxyKubeClient) {
            let writes = self.writes.clone();
            mock.expect_patch_facade_status()
                .returning(move |_, _, _, rv, status| {
                    writes.lock().unwrap().push((rv, status.clone()));
                    Ok(())
                });
        }

        fn count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        fn last_ready(&self) -> Condition {
            let writes = self.writes.lock().unwrap();
            let (_, status) = writes.last().expect("a status write");
            let conditions: Vec<Condition> =
                serde_json::from_value(status["conditions"].clone()).unwrap();
            find_condition(&conditions, CONDITION_READY).unwrap().clone()
        }

        fn last(&self) -> serde_json::Value {
            self.writes.lock().unwrap().last().unwrap().1.clone()
        }
    }

    fn idle_spawner<F: Facade>() -> Spawner<F> {
        Arc::new(|_ar: ApiResource, _tx: mpsc::UnboundedSender<ObjectRef<F>>| {
            tokio::spawn(futures::future::pending::<()>())
        })
    }

    fn context<F: Facade>(mock: MockProxyKubeClient) -> Arc<ProxyContext<F>> {
        let kube: Arc<dyn ProxyKubeClient> = Arc::new(mock);
        let (watches, _rx) = WatchRegistrar::with_spawner(idle_spawner::<F>());
        Arc::new(ProxyContext::new(
            kube.clone(),
            Arc::new(ProviderRegistry::new(kube)),
            Arc::new(watches),
            Duration::from_secs(300),
        ))
    }

    fn expect_provider_lookup(mock: &mut MockProxyKubeClient) {
        mock.expect_list_providers()
            .returning(|| Ok(vec![provider()]));
        mock.expect_discover_resource().returning(|_, _| Ok(None));
    }

    fn conflict() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    // =========================================================================
    // Inventory lifecycle
    // =========================================================================

    /// Story: a new inventory for a registered provider gets a backend that
    /// mirrors its spec, is controlled by the facade, and reports pending.
    #[tokio::test]
    async fn story_new_inventory_creates_backend() {
        let inv = inventory(false, InventoryPolicy::default());
        let created: Arc<Mutex<Option<DynamicObject>>> = Arc::default();
        let capture = StatusCapture::default();

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend().returning(|_, _, _| Ok(None));
        let slot = created.clone();
        mock.expect_create_backend().returning(move |ar, _, obj| {
            assert_eq!(ar.kind, "CrunchyInventory");
            *slot.lock().unwrap() = Some(obj.clone());
            Ok(obj.clone())
        });
        capture.install(&mut mock);

        let action = reconcile(Arc::new(inv.clone()), context(mock)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let backend = created.lock().unwrap().clone().unwrap();
        assert_eq!(backend.data["spec"], inv.spec_value().unwrap());
        assert_eq!(backend.metadata.namespace.as_deref(), Some("inv-ns"));
        let owner = controller_owner(&backend).unwrap();
        assert_eq!(owner.uid, "inv-uid");
        assert_eq!(owner.kind, "DBaaSInventory");

        let ready = capture.last_ready();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, reasons::BACKEND_PENDING);
        assert_eq!(capture.writes.lock().unwrap()[0].0.as_deref(), Some("10"));
    }

    /// Story: backend status, including upstream failures, is reflected on
    /// the facade verbatim and the backend itself is left alone.
    #[tokio::test]
    async fn story_backend_status_propagates_to_facade() {
        let inv = inventory(false, InventoryPolicy::default());
        let backend = backend_for(
            &inv,
            "CrunchyInventory",
            Some(serde_json::json!({
                "conditions": [{
                    "type": "Ready",
                    "status": "False",
                    "reason": "AuthenticationFailed",
                    "message": "invalid API key"
                }],
                "databaseServices": [{"serviceID": "svc-1", "serviceName": "orders"}],
                "providerCursor": "abc"
            })),
        );
        let capture = StatusCapture::default();

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(backend.clone())));
        capture.install(&mut mock);

        reconcile(Arc::new(inv), context(mock)).await.unwrap();

        let ready = capture.last_ready();
        assert_eq!(ready.reason, "AuthenticationFailed");
        assert_eq!(ready.message, "invalid API key");
        let status = capture.last();
        assert_eq!(status["databaseServices"][0]["serviceID"], "svc-1");
        assert!(status.get("providerCursor").is_none());
    }

    /// Story: when the backend stops reporting database services, the stale
    /// list is removed from the facade and the next pass writes nothing.
    #[tokio::test]
    async fn story_fields_dropped_by_backend_are_cleared() {
        let conditions = serde_json::json!([{
            "type": "Ready",
            "status": "True",
            "reason": "SyncOK",
            "message": "",
            "lastTransitionTime": "2024-01-01T00:00:00Z"
        }]);
        let mut inv = inventory(false, InventoryPolicy::default());
        inv.status = Some(
            serde_json::from_value(serde_json::json!({
                "conditions": conditions,
                "databaseServices": [{"serviceID": "old"}]
            }))
            .unwrap(),
        );
        let backend = backend_for(
            &inv,
            "CrunchyInventory",
            Some(serde_json::json!({ "conditions": conditions })),
        );
        let capture = StatusCapture::default();

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        let first = backend.clone();
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(first.clone())));
        capture.install(&mut mock);

        reconcile(Arc::new(inv.clone()), context(mock)).await.unwrap();
        assert_eq!(capture.count(), 1);
        assert_eq!(capture.last(), serde_json::json!({ "databaseServices": null }));

        // Stored state after the server applied the patch
        let mut converged = inv;
        converged.status =
            Some(serde_json::from_value(serde_json::json!({ "conditions": conditions })).unwrap());

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(backend.clone())));
        mock.expect_patch_facade_status().never();
        reconcile(Arc::new(converged), context(mock)).await.unwrap();
    }

    #[test]
    fn merge_patch_nulls_removed_keys_and_diffs_nested_maps() {
        let stored = serde_json::json!({
            "phase": "Creating",
            "instanceID": "i-1",
            "instanceInfo": {"host": "db.local", "port": "5432"}
        });
        let desired = serde_json::json!({
            "phase": "Ready",
            "instanceInfo": {"host": "db.local"}
        });
        assert_eq!(
            merge_patch(&stored, &desired),
            serde_json::json!({
                "phase": "Ready",
                "instanceID": null,
                "instanceInfo": {"port": null}
            })
        );
        assert_eq!(merge_patch(&serde_json::Value::Null, &desired), desired);
    }

    /// Story: once the facade reflects its backend, reconciling again writes
    /// nothing at all.
    #[tokio::test]
    async fn story_converged_inventory_is_idempotent() {
        let backend_status = serde_json::json!({
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "reason": "SyncOK",
                "message": "",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        });
        let mut inv = inventory(false, InventoryPolicy::default());
        inv.status = Some(serde_json::from_value(backend_status.clone()).unwrap());
        let backend = backend_for(&inv, "CrunchyInventory", Some(backend_status));

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(backend.clone())));
        mock.expect_create_backend().never();
        mock.expect_replace_backend().never();
        mock.expect_patch_facade_status().never();

        let action = reconcile(Arc::new(inv), context(mock)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    /// Story: repeated reconciles with a backend that reports no status keep
    /// the pending condition's transition time stable.
    #[tokio::test]
    async fn story_pending_backend_is_stable_across_reconciles() {
        let inv = inventory(false, InventoryPolicy::default());
        let backend = backend_for(&inv, "CrunchyInventory", None);
        let pending = derive_status(&inv, &backend).unwrap();

        let mut again = inv.clone();
        again.status = Some(pending.clone());
        assert_eq!(derive_status(&again, &backend).unwrap(), pending);
    }

    /// Story: editing a facade's spec replaces the backend spec while
    /// keeping the backend's resourceVersion as the precondition.
    #[tokio::test]
    async fn story_spec_drift_replaces_backend() {
        let inv = inventory(false, InventoryPolicy::default());
        let mut stale = backend_for(&inv, "CrunchyInventory", None);
        stale.data["spec"]["credentialsRef"]["name"] = serde_json::json!("old-creds");
        let replaced: Arc<Mutex<Option<DynamicObject>>> = Arc::default();
        let capture = StatusCapture::default();

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(stale.clone())));
        let slot = replaced.clone();
        mock.expect_replace_backend().returning(move |_, _, obj| {
            *slot.lock().unwrap() = Some(obj.clone());
            Ok(obj.clone())
        });
        capture.install(&mut mock);

        reconcile(Arc::new(inv.clone()), context(mock)).await.unwrap();

        let sent = replaced.lock().unwrap().clone().unwrap();
        assert_eq!(sent.data["spec"], inv.spec_value().unwrap());
        assert_eq!(sent.metadata.resource_version.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn replace_conflict_requeues_without_error() {
        let inv = inventory(false, InventoryPolicy::default());
        let mut stale = backend_for(&inv, "CrunchyInventory", None);
        stale.data["spec"]["credentialsRef"]["name"] = serde_json::json!("old-creds");

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(stale.clone())));
        mock.expect_replace_backend()
            .returning(|_, _, _| Err(conflict()));
        mock.expect_patch_facade_status().never();

        let action = reconcile(Arc::new(inv), context(mock)).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
    }

    #[tokio::test]
    async fn status_conflict_requeues_without_error() {
        let inv = inventory(false, InventoryPolicy::default());
        let backend = backend_for(&inv, "CrunchyInventory", None);

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(backend.clone())));
        mock.expect_patch_facade_status()
            .returning(|_, _, _, _, _| Err(conflict()));

        let action = reconcile(Arc::new(inv), context(mock)).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
    }

    /// Story: an inventory naming an unregistered provider reports
    /// ProviderNotFound and fails so error_policy backs off.
    #[tokio::test]
    async fn story_unregistered_provider_is_reported() {
        let inv = Arc::new(inventory(false, InventoryPolicy::default()));
        let capture = StatusCapture::default();

        let mut mock = MockProxyKubeClient::new();
        mock.expect_list_providers().returning(|| Ok(vec![]));
        mock.expect_get_backend().never();
        capture.install(&mut mock);
        let ctx = context(mock);

        let err = reconcile(inv.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound { .. }));
        assert_eq!(capture.last_ready().reason, reasons::PROVIDER_NOT_FOUND);

        assert_eq!(
            error_policy(inv.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(inv, &err, ctx),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn backend_controlled_by_another_object_is_refused() {
        let inv = inventory(false, InventoryPolicy::default());
        let mut foreign = backend_for(&inv, "CrunchyInventory", None);
        if let Some(refs) = foreign.metadata.owner_references.as_mut() {
            refs[0].uid = "someone-else".to_string();
        }

        let mut mock = MockProxyKubeClient::new();
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend()
            .returning(move |_, _, _| Ok(Some(foreign.clone())));
        mock.expect_replace_backend().never();

        let inv = Arc::new(inv);
        let ctx = context(mock);
        let err = reconcile(inv.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(
            error_policy(inv, &err, ctx.clone()),
            Action::requeue(Duration::from_secs(300))
        );
        assert_eq!(ctx.backoff.failures("inv-ns/inv1"), 0);
    }

    // =========================================================================
    // Connection and instance gating
    // =========================================================================

    #[tokio::test]
    async fn missing_inventory_blocks_connection() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory().returning(|_, _| Ok(None));
        mock.expect_list_providers().never();
        capture.install(&mut mock);

        let err = reconcile(Arc::new(connection("inv-ns")), context(mock))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InventoryNotFound { .. }));
        assert_eq!(capture.last_ready().reason, reasons::INVENTORY_NOT_FOUND);
    }

    #[tokio::test]
    async fn unready_inventory_requeues_connection() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory()
            .returning(|_, _| Ok(Some(inventory(false, InventoryPolicy::default()))));
        capture.install(&mut mock);

        let action = reconcile(Arc::new(connection("inv-ns")), context(mock))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(INVENTORY_NOT_READY_REQUEUE));
        assert_eq!(capture.last_ready().reason, reasons::INVENTORY_NOT_READY);
    }

    /// Story: without any policy an inventory only serves its own namespace,
    /// so a connection from elsewhere is rejected and no backend is touched.
    #[tokio::test]
    async fn story_foreign_namespace_connection_is_rejected_by_default() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory()
            .returning(|_, _| Ok(Some(inventory(true, InventoryPolicy::default()))));
        mock.expect_list_policies().returning(|_| Ok(vec![]));
        mock.expect_get_backend().never();
        capture.install(&mut mock);

        let action = reconcile(Arc::new(connection("team-a")), context(mock))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(
            capture.last_ready().reason,
            reasons::INVALID_CONNECTION_NAMESPACE
        );
    }

    /// Story: a namespace policy allowing every namespace lets a foreign
    /// connection through to the provider's connection kind.
    #[tokio::test]
    async fn story_policy_wildcard_admits_foreign_connection() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory()
            .returning(|_, _| Ok(Some(inventory(true, InventoryPolicy::default()))));
        mock.expect_list_policies().returning(|_| {
            Ok(vec![policy(InventoryPolicy {
                connection_namespaces: Some(vec!["*".to_string()]),
                ..Default::default()
            })])
        });
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend().returning(|_, _, _| Ok(None));
        mock.expect_create_backend().returning(|ar, ns, obj| {
            assert_eq!(ar.kind, "CrunchyConnection");
            assert_eq!(ns, "team-a");
            Ok(obj.clone())
        });
        capture.install(&mut mock);

        reconcile(Arc::new(connection("team-a")), context(mock))
            .await
            .unwrap();
        assert_eq!(capture.last_ready().reason, reasons::BACKEND_PENDING);
    }

    #[tokio::test]
    async fn selector_policy_consults_namespace_labels() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory().returning(|_, _| {
            Ok(Some(inventory(
                true,
                InventoryPolicy {
                    connection_ns_selector: Some(dbaas_common::crd::NamespaceSelector {
                        match_labels: Some(BTreeMap::from([(
                            "dbaas".to_string(),
                            "enabled".to_string(),
                        )])),
                        match_expressions: vec![],
                    }),
                    ..Default::default()
                },
            )))
        });
        mock.expect_list_policies().returning(|_| Ok(vec![]));
        mock.expect_namespace_labels()
            .times(1)
            .returning(|_| Ok(BTreeMap::new()));
        capture.install(&mut mock);

        let action = reconcile(Arc::new(connection("team-a")), context(mock))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    /// Story: an instance against an inventory whose policy disables
    /// provisioning is refused and no backend instance is created.
    #[tokio::test]
    async fn story_disabled_provisioning_blocks_instance() {
        let capture = StatusCapture::default();
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory()
            .returning(|_, _| Ok(Some(inventory(true, InventoryPolicy::default()))));
        mock.expect_list_policies().returning(|_| {
            Ok(vec![policy(InventoryPolicy {
                disable_provisions: Some(true),
                ..Default::default()
            })])
        });
        mock.expect_create_backend().never();
        capture.install(&mut mock);

        let action = reconcile(Arc::new(instance()), context(mock)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(
            capture.last_ready().reason,
            reasons::INVENTORY_NOT_PROVISIONABLE
        );
    }

    #[tokio::test]
    async fn inventory_override_reenables_provisioning() {
        let mut mock = MockProxyKubeClient::new();
        mock.expect_get_inventory().returning(|_, _| {
            Ok(Some(inventory(
                true,
                InventoryPolicy {
                    disable_provisions: Some(false),
                    ..Default::default()
                },
            )))
        });
        mock.expect_list_policies().returning(|_| {
            Ok(vec![policy(InventoryPolicy {
                disable_provisions: Some(true),
                ..Default::default()
            })])
        });
        expect_provider_lookup(&mut mock);
        mock.expect_get_backend().returning(|_, _, _| Ok(None));
        mock.expect_create_backend()
            .times(1)
            .returning(|ar, _, obj| {
                assert_eq!(ar.kind, "CrunchyInstance");
                Ok(obj.clone())
            });
        StatusCapture::default().install(&mut mock);

        reconcile(Arc::new(instance()), context(mock)).await.unwrap();
    }
}
