//! Runtime registration of backend watches
//!
//! Backend kinds are only known once a provider registers, so the facade
//! controllers cannot declare them up front. Each controller owns one
//! [`WatchRegistrar`]; reconciles call [`WatchRegistrar::ensure_watch`] and
//! backend events come back as facade `ObjectRef`s on the channel that feeds
//! `Controller::reconcile_on`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dbaas_common::crd::{DBaaSInventory, DBaaSPolicy};
use dbaas_common::kube_utils::{controller_owner, is_controlled_by, type_key};

use crate::facade::Facade;

/// Starts the watch task for one backend kind
pub type Spawner<F> =
    Arc<dyn Fn(ApiResource, mpsc::UnboundedSender<ObjectRef<F>>) -> JoinHandle<()> + Send + Sync>;

/// Map a backend object to the facade that controls it.
///
/// Objects without a controller owner of kind `F` are dropped.
pub fn owning_facade<F: Facade>(obj: &DynamicObject) -> Option<ObjectRef<F>> {
    let owner = controller_owner(obj)?;
    if !is_controlled_by(owner, &F::api_version(&()), &F::kind(&())) {
        return None;
    }
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(&owner.name).within(&namespace))
}

/// Facades in `store` whose inventory matches `namespace` and, if given, `name`
fn facades_referencing<F: Facade>(
    store: &Store<F>,
    namespace: &str,
    name: Option<&str>,
) -> Vec<ObjectRef<F>> {
    store
        .state()
        .iter()
        .filter(|f| {
            let (Some(inv), Some(own_ns)) = (f.inventory_ref(), f.namespace()) else {
                return false;
            };
            inv.namespace_or(&own_ns) == namespace && name.is_none_or(|n| inv.name == n)
        })
        .map(|f| ObjectRef::from_obj(f.as_ref()))
        .collect()
}

/// Map an inventory event to the connections or instances that use it
pub fn dependents_of_inventory<F: Facade>(
    store: &Store<F>,
    inventory: &DBaaSInventory,
) -> Vec<ObjectRef<F>> {
    let Some(namespace) = inventory.namespace() else {
        return Vec::new();
    };
    facades_referencing(store, &namespace, Some(&inventory.name_any()))
}

/// Map a policy event to every facade using an inventory in its namespace
pub fn dependents_of_policy<F: Facade>(
    store: &Store<F>,
    policy: &DBaaSPolicy,
) -> Vec<ObjectRef<F>> {
    let Some(namespace) = policy.namespace() else {
        return Vec::new();
    };
    facades_referencing(store, &namespace, None)
}

/// Map a namespace event to the connections or instances living in it.
///
/// Namespace labels feed the inventory gate's selector.
pub fn dependents_of_namespace<F: Facade>(
    store: &Store<F>,
    namespace: &Namespace,
) -> Vec<ObjectRef<F>> {
    let name = namespace.name_any();
    store
        .state()
        .iter()
        .filter(|f| f.inventory_ref().is_some() && f.namespace().as_deref() == Some(name.as_str()))
        .map(|f| ObjectRef::from_obj(f.as_ref()))
        .collect()
}

/// Spawner backed by a real `kube::runtime::watcher`
pub fn kube_spawner<F: Facade>(client: Client, watch_timeout_secs: u32) -> Spawner<F> {
    Arc::new(move |ar: ApiResource, tx: mpsc::UnboundedSender<ObjectRef<F>>| {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let config = watcher::Config::default().timeout(watch_timeout_secs);
        tokio::spawn(async move {
            let mut events = watcher(api, config).default_backoff().touched_objects().boxed();
            while let Some(event) = events.next().await {
                match event {
                    Ok(obj) => {
                        if let Some(facade) = owning_facade::<F>(&obj) {
                            if tx.send(facade).is_err() {
                                debug!(kind = %ar.kind, "controller gone, stopping backend watch");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(kind = %ar.kind, error = %e, "backend watch error"),
                }
            }
        })
    })
}

struct Registration {
    handle: JoinHandle<()>,
    providers: BTreeSet<String>,
}

#[derive(Default)]
struct WatchState {
    by_type: HashMap<String, Registration>,
    by_provider: HashMap<String, String>,
}

/// Idempotent registry of backend watches for one facade controller
pub struct WatchRegistrar<F: Facade> {
    state: Mutex<WatchState>,
    sender: mpsc::UnboundedSender<ObjectRef<F>>,
    spawner: Spawner<F>,
}

impl<F: Facade> WatchRegistrar<F> {
    /// Registrar using real watchers; the receiver feeds `reconcile_on`
    pub fn new(
        client: Client,
        watch_timeout_secs: u32,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectRef<F>>) {
        Self::with_spawner(kube_spawner(client, watch_timeout_secs))
    }

    /// Registrar using a custom spawner
    pub fn with_spawner(spawner: Spawner<F>) -> (Self, mpsc::UnboundedReceiver<ObjectRef<F>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(WatchState::default()),
                sender,
                spawner,
            },
            receiver,
        )
    }

    /// Make sure the backend kind `ar` is watched on behalf of `provider`.
    ///
    /// Returns true when a new watch task was started. A provider whose kind
    /// for this role changed releases its previous kind, and that watch is
    /// stopped once no provider uses it.
    pub fn ensure_watch(&self, provider: &str, ar: &ApiResource) -> bool {
        let key = type_key(&ar.api_version, &ar.kind);
        let mut state = self.state.lock();

        if let Some(previous) = state.by_provider.get(provider).cloned() {
            if previous != key {
                Self::release(&mut state, provider, &previous);
            }
        }
        state.by_provider.insert(provider.to_string(), key.clone());

        if let Some(existing) = state.by_type.get_mut(&key) {
            existing.providers.insert(provider.to_string());
            if !existing.handle.is_finished() {
                return false;
            }
            warn!(type_key = %key, role = %F::ROLE, "backend watch ended, restarting");
            existing.handle = (self.spawner)(ar.clone(), self.sender.clone());
            return true;
        }

        info!(type_key = %key, role = %F::ROLE, provider = %provider, "watching backend kind");
        let handle = (self.spawner)(ar.clone(), self.sender.clone());
        state.by_type.insert(
            key,
            Registration {
                handle,
                providers: BTreeSet::from([provider.to_string()]),
            },
        );
        true
    }

    fn release(state: &mut WatchState, provider: &str, key: &str) {
        let Some(registration) = state.by_type.get_mut(key) else {
            return;
        };
        registration.providers.remove(provider);
        if registration.providers.is_empty() {
            if let Some(registration) = state.by_type.remove(key) {
                registration.handle.abort();
                info!(type_key = %key, role = %F::ROLE, "stopped watching backend kind");
            }
        }
    }

    /// Type keys currently watched
    pub fn watched(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().by_type.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<F: Facade> Drop for WatchRegistrar<F> {
    fn drop(&mut self) {
        for registration in self.state.get_mut().by_type.values() {
            registration.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbaas_common::crd::DBaaSInventory;
    use dbaas_common::kube_utils::build_api_resource;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_spawner() -> (Spawner<DBaaSInventory>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let spawner: Spawner<DBaaSInventory> = Arc::new(
            move |_ar: ApiResource, _tx: mpsc::UnboundedSender<ObjectRef<DBaaSInventory>>| {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(futures::future::pending::<()>())
            },
        );
        (spawner, count)
    }

    fn backend(owner_kind: &str, controller: bool) -> DynamicObject {
        let ar = build_api_resource("crunchy.example.com/v1alpha1", "CrunchyInventory");
        let mut obj = DynamicObject::new("inv1", &ar).within("inv-ns");
        obj.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "dbaas.dev/v1beta1".to_string(),
            kind: owner_kind.to_string(),
            name: "inv1".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }]);
        obj
    }

    #[tokio::test]
    async fn same_kind_is_watched_once() {
        let (spawner, count) = counting_spawner();
        let (registrar, _rx) = WatchRegistrar::<DBaaSInventory>::with_spawner(spawner);
        let ar = build_api_resource("crunchy.example.com/v1alpha1", "CrunchyInventory");

        assert!(registrar.ensure_watch("crunchy", &ar));
        assert!(!registrar.ensure_watch("crunchy", &ar));
        // A second provider sharing the kind does not start another watch
        assert!(!registrar.ensure_watch("crunchy-alias", &ar));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_kind_replaces_previous_watch() {
        let (spawner, count) = counting_spawner();
        let (registrar, _rx) = WatchRegistrar::<DBaaSInventory>::with_spawner(spawner);
        let v1 = build_api_resource("crunchy.example.com/v1alpha1", "CrunchyInventory");
        let v2 = build_api_resource("crunchy.example.com/v1", "CrunchyInventory");

        registrar.ensure_watch("crunchy", &v1);
        assert!(registrar.ensure_watch("crunchy", &v2));

        assert_eq!(registrar.watched(), vec!["crunchy.example.com/v1/CrunchyInventory"]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shared_kind_survives_one_provider_moving_away() {
        let (spawner, _count) = counting_spawner();
        let (registrar, _rx) = WatchRegistrar::<DBaaSInventory>::with_spawner(spawner);
        let shared = build_api_resource("shared.example.com/v1", "SharedInventory");
        let other = build_api_resource("other.example.com/v1", "OtherInventory");

        registrar.ensure_watch("a", &shared);
        registrar.ensure_watch("b", &shared);
        registrar.ensure_watch("a", &other);

        assert_eq!(
            registrar.watched(),
            vec![
                "other.example.com/v1/OtherInventory".to_string(),
                "shared.example.com/v1/SharedInventory".to_string(),
            ]
        );
    }

    #[test]
    fn inventory_policy_and_namespace_events_map_to_dependents() {
        use dbaas_common::crd::{
            DBaaSConnection, DBaaSConnectionSpec, DBaaSInventorySpec, DBaaSPolicySpec,
            InventoryPolicy, LocalObjectRef, NamespacedRef, ProviderRef,
        };

        let conn = |name: &str, ns: &str, inv: &str, inv_ns: Option<&str>| {
            let mut c = DBaaSConnection::new(
                name,
                DBaaSConnectionSpec {
                    inventory_ref: NamespacedRef {
                        name: inv.to_string(),
                        namespace: inv_ns.map(String::from),
                    },
                    database_service_id: "svc".to_string(),
                    database_service_name: None,
                    database_service_type: None,
                },
            );
            c.metadata.namespace = Some(ns.to_string());
            c
        };

        let (reader, mut writer) = kube::runtime::reflector::store::<DBaaSConnection>();
        for c in [
            conn("c1", "team-a", "inv1", Some("inv-ns")),
            conn("c2", "inv-ns", "inv1", None),
            conn("c3", "team-a", "inv2", Some("inv-ns")),
            conn("c4", "team-b", "inv1", Some("elsewhere")),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(c));
        }

        let mut inventory = DBaaSInventory::new(
            "inv1",
            DBaaSInventorySpec {
                provider_ref: ProviderRef {
                    name: "crunchy".to_string(),
                },
                credentials_ref: LocalObjectRef {
                    name: "creds".to_string(),
                },
                authz: None,
                policy: InventoryPolicy::default(),
            },
        );
        inventory.metadata.namespace = Some("inv-ns".to_string());
        let mut names: Vec<String> = dependents_of_inventory(&reader, &inventory)
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["c1", "c2"]);

        let mut policy = DBaaSPolicy::new("p", DBaaSPolicySpec::default());
        policy.metadata.namespace = Some("inv-ns".to_string());
        let mut names: Vec<String> = dependents_of_policy(&reader, &policy)
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["c1", "c2", "c3"]);

        let team_a = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut names: Vec<String> = dependents_of_namespace(&reader, &team_a)
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["c1", "c3"]);
    }

    #[test]
    fn backend_events_map_to_owning_facade() {
        let r = owning_facade::<DBaaSInventory>(&backend("DBaaSInventory", true)).unwrap();
        assert_eq!(r.name, "inv1");
        assert_eq!(r.namespace.as_deref(), Some("inv-ns"));
    }

    #[test]
    fn foreign_or_non_controller_owners_are_dropped() {
        assert!(owning_facade::<DBaaSInventory>(&backend("DBaaSConnection", true)).is_none());
        assert!(owning_facade::<DBaaSInventory>(&backend("DBaaSInventory", false)).is_none());
    }
}
