//! Controller runner - builds controller futures for each concern
//!
//! Each `build_*` function returns boxed futures that the caller joins. The
//! facade controllers are generic over the facade kind; connection and
//! instance controllers also re-trigger on inventory, policy and namespace
//! changes because all three feed their admission gate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio_stream::wrappers::UnboundedReceiverStream;

use dbaas_authz::{self as authz, AuthzContext};
use dbaas_common::crd::{
    DBaaSConnection, DBaaSInstance, DBaaSInventory, DBaaSPolicy, DBaaSProvider, DBaaSTenant,
    FacadeKind,
};
use dbaas_policy::{self as policy, PolicyContext};
use dbaas_proxy::{
    self as proxy, dependents_of_inventory, dependents_of_namespace, dependents_of_policy, Facade,
    ProviderRegistry, ProxyContext, ProxyKubeClient, ProxyKubeClientImpl, WatchRegistrar,
};

use crate::config::ControllerConfig;

/// A controller loop ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config(config: &ControllerConfig) -> WatcherConfig {
    WatcherConfig::default().timeout(config.watch_timeout_secs)
}

fn runtime_config(config: &ControllerConfig) -> ControllerRuntimeConfig {
    ControllerRuntimeConfig::default().concurrency(config.concurrency)
}

/// Build one facade controller.
///
/// Backend events arrive through the controller's [`WatchRegistrar`] channel.
fn build_facade_controller<F: Facade>(
    client: Client,
    kube: Arc<dyn ProxyKubeClient>,
    registry: Arc<ProviderRegistry>,
    config: &ControllerConfig,
    name: &'static str,
) -> ControllerFuture {
    let (watches, backend_events) = WatchRegistrar::<F>::new(client.clone(), config.watch_timeout_secs);
    let ctx = Arc::new(ProxyContext::new(
        kube,
        registry,
        Arc::new(watches),
        config.requeue_interval(),
    ));

    let facades: Api<F> = Api::all(client.clone());
    let mut controller = Controller::new(facades, watcher_config(config))
        .with_config(runtime_config(config))
        .reconcile_on(UnboundedReceiverStream::new(backend_events));

    if F::ROLE != FacadeKind::Inventory {
        let store = controller.store();
        controller = controller.watches(
            Api::<DBaaSInventory>::all(client.clone()),
            watcher_config(config),
            move |inventory| dependents_of_inventory(&store, &inventory),
        );
        let store = controller.store();
        controller = controller.watches(
            Api::<DBaaSPolicy>::all(client.clone()),
            watcher_config(config),
            move |policy| dependents_of_policy(&store, &policy),
        );
        let store = controller.store();
        controller = controller.watches(
            Api::<Namespace>::all(client),
            watcher_config(config),
            move |namespace| dependents_of_namespace(&store, &namespace),
        );
    }

    tracing::info!("- {} controller", name);

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(proxy::reconcile::<F>, proxy::error_policy::<F>, ctx)
            .for_each(log_reconcile_result(name)),
    )
}

/// Mirror DBaaSProvider registrations into a store the registry reads from
fn spawn_provider_reflector(
    client: Client,
    config: &ControllerConfig,
) -> reflector::Store<DBaaSProvider> {
    let (reader, writer) = reflector::store();
    let stream = watcher(Api::<DBaaSProvider>::all(client), watcher_config(config))
        .default_backoff()
        .reflect(writer)
        .touched_objects();
    tokio::spawn(stream.for_each(|event| {
        if let Err(e) = event {
            tracing::warn!(error = %e, "provider watch error");
        }
        std::future::ready(())
    }));
    reader
}

/// Build the three facade proxy controllers, sharing one provider registry
pub fn build_facade_controllers(client: Client, config: &ControllerConfig) -> Vec<ControllerFuture> {
    let kube: Arc<dyn ProxyKubeClient> =
        Arc::new(ProxyKubeClientImpl::new(client.clone(), &config.field_manager));
    let providers = spawn_provider_reflector(client.clone(), config);
    let registry = Arc::new(ProviderRegistry::new(kube.clone()).with_store(providers));

    vec![
        build_facade_controller::<DBaaSInventory>(
            client.clone(),
            kube.clone(),
            registry.clone(),
            config,
            "DBaaSInventory",
        ),
        build_facade_controller::<DBaaSConnection>(
            client.clone(),
            kube.clone(),
            registry.clone(),
            config,
            "DBaaSConnection",
        ),
        build_facade_controller::<DBaaSInstance>(client, kube, registry, config, "DBaaSInstance"),
    ]
}

/// Build the policy arbitration controller
pub fn build_policy_controller(client: Client, config: &ControllerConfig) -> ControllerFuture {
    let ctx = Arc::new(PolicyContext::new(
        client.clone(),
        &config.field_manager,
        config.requeue_interval(),
    ));
    let policies: Api<DBaaSPolicy> = Api::all(client);

    let controller = Controller::new(policies.clone(), watcher_config(config))
        .with_config(runtime_config(config));
    let store = controller.store();
    let controller = controller.watches(policies, watcher_config(config), move |changed| {
        policy::sibling_policies(&store, &changed)
    });

    tracing::info!("- DBaaSPolicy controller");

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(policy::reconcile, policy::error_policy, ctx)
            .for_each(log_reconcile_result("DBaaSPolicy")),
    )
}

/// Build the namespace-keyed authorization controller
pub fn build_authz_controller(client: Client, config: &ControllerConfig) -> ControllerFuture {
    let ctx = Arc::new(AuthzContext::new(
        client.clone(),
        &config.field_manager,
        config.requeue_interval(),
    ));

    let controller = Controller::new(Api::<Namespace>::all(client.clone()), watcher_config(config))
        .with_config(runtime_config(config))
        .watches(
            Api::<Role>::all(client.clone()),
            watcher_config(config),
            authz::namespace_of_rbac,
        )
        .watches(
            Api::<RoleBinding>::all(client.clone()),
            watcher_config(config),
            authz::namespace_of_rbac,
        )
        .watches(
            Api::<DBaaSInventory>::all(client.clone()),
            watcher_config(config),
            authz::namespace_of_inventory,
        )
        .watches(
            Api::<DBaaSTenant>::all(client),
            watcher_config(config),
            authz::namespace_of_tenant,
        );

    tracing::info!("- Authorization controller");

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(authz::reconcile, authz::error_policy, ctx)
            .for_each(log_reconcile_result("Authorization")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
