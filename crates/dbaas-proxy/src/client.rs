//! Kubernetes operations used by the facade reconcilers

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use dbaas_common::crd::{DBaaSInventory, DBaaSPolicy, DBaaSProvider};
use dbaas_common::kube_utils::{discover_api_resource, namespace_labels};
use dbaas_common::Error;

/// Trait abstracting the API calls of the facade reconcilers
///
/// Backend objects are addressed by `ApiResource` since their kind is only
/// known at runtime.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyKubeClient: Send + Sync {
    /// List all provider registrations
    async fn list_providers(&self) -> Result<Vec<DBaaSProvider>, Error>;

    /// Fetch an inventory, `None` if it does not exist
    async fn get_inventory(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DBaaSInventory>, Error>;

    /// List the DBaaSPolicies of a namespace
    async fn list_policies(&self, namespace: &str) -> Result<Vec<DBaaSPolicy>, Error>;

    /// Labels of a namespace (empty if the namespace is gone)
    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>, Error>;

    /// Resolve `apiVersion/kind` through API discovery
    async fn discover_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<Option<ApiResource>, Error>;

    /// Fetch a backend object, `None` if it does not exist
    async fn get_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a backend object
    async fn create_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace a backend object; `obj` carries the resourceVersion precondition
    async fn replace_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Merge-patch a facade's status subresource guarded by `resource_version`
    async fn patch_facade_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ProxyKubeClientImpl {
    client: Client,
    field_manager: String,
}

impl ProxyKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn dynamic_api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

#[async_trait]
impl ProxyKubeClient for ProxyKubeClientImpl {
    async fn list_providers(&self) -> Result<Vec<DBaaSProvider>, Error> {
        let api: Api<DBaaSProvider> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_inventory(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DBaaSInventory>, Error> {
        let api: Api<DBaaSInventory> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<DBaaSPolicy>, Error> {
        let api: Api<DBaaSPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>, Error> {
        namespace_labels(&self.client, namespace).await
    }

    async fn discover_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<Option<ApiResource>, Error> {
        discover_api_resource(&self.client, api_version, kind).await
    }

    async fn get_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic_api(ar, namespace).get_opt(name).await?)
    }

    async fn create_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let pp = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(self.dynamic_api(ar, namespace).create(&pp, obj).await?)
    }

    async fn replace_backend(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation(namespace, "backend object has no name"))?;
        let pp = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(self
            .dynamic_api(ar, namespace)
            .replace(name, &pp, obj)
            .await?)
    }

    async fn patch_facade_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status
        });
        self.dynamic_api(ar, namespace)
            .patch_status(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
