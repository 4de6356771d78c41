//! Kubernetes operations used by the authorization synthesizer

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use dbaas_common::crd::{tenants_for_namespace, DBaaSInventory, DBaaSTenant, TENANT_INVENTORY_NAMESPACE_FIELD};
use dbaas_common::Error;

/// HTTP status for a field selector the server does not index
const HTTP_BAD_REQUEST: u16 = 400;

/// Kubernetes operations needed by the authorization synthesizer.
///
/// Patches carry the resourceVersion they were computed from and fail with
/// 409 when it is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthzKubeClient: Send + Sync {
    /// Inventories in a namespace
    async fn list_inventories(&self, namespace: &str) -> Result<Vec<DBaaSInventory>, Error>;

    /// Tenants claiming a namespace, oldest first
    async fn list_tenants_for_namespace(&self, namespace: &str)
        -> Result<Vec<DBaaSTenant>, Error>;

    /// Get a Role
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error>;

    /// Create a Role
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// Replace a Role's rules
    async fn patch_role_rules(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        rules: &[PolicyRule],
    ) -> Result<(), Error>;

    /// Get a RoleBinding
    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error>;

    /// Create a RoleBinding
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error>;

    /// Replace a RoleBinding's subjects
    async fn patch_role_binding_subjects(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        subjects: &[Subject],
    ) -> Result<(), Error>;

    /// Delete a RoleBinding
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a ClusterRole
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error>;

    /// Create a ClusterRole
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<(), Error>;

    /// Replace a ClusterRole's rules
    async fn patch_cluster_role_rules(
        &self,
        name: &str,
        resource_version: Option<String>,
        rules: &[PolicyRule],
    ) -> Result<(), Error>;

    /// Get a ClusterRoleBinding
    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error>;

    /// Create a ClusterRoleBinding
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding)
        -> Result<(), Error>;

    /// Replace a ClusterRoleBinding's subjects
    async fn patch_cluster_role_binding_subjects(
        &self,
        name: &str,
        resource_version: Option<String>,
        subjects: &[Subject],
    ) -> Result<(), Error>;

    /// Delete a ClusterRoleBinding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct AuthzKubeClientImpl {
    client: Client,
    field_manager: String,
}

impl AuthzKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    async fn create<K>(&self, api: Api<K>, obj: &K) -> Result<(), Error>
    where
        K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    {
        api.create(&self.post_params(), obj).await?;
        Ok(())
    }

    /// Merge-patch one top-level field with a resourceVersion precondition
    async fn patch_field<K, V>(
        &self,
        api: Api<K>,
        name: &str,
        resource_version: Option<String>,
        field: &str,
        value: &V,
    ) -> Result<(), Error>
    where
        K: Resource + Clone + Debug + DeserializeOwned,
        V: Serialize + Sync + ?Sized,
    {
        let mut patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
        });
        patch[field] = serde_json::to_value(value)?;
        api.patch(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete<K>(&self, api: Api<K>, name: &str) -> Result<(), Error>
    where
        K: Resource + Clone + Debug + DeserializeOwned,
    {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if dbaas_common::kube_utils::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AuthzKubeClient for AuthzKubeClientImpl {
    async fn list_inventories(&self, namespace: &str) -> Result<Vec<DBaaSInventory>, Error> {
        let api: Api<DBaaSInventory> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_tenants_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<DBaaSTenant>, Error> {
        let api: Api<DBaaSTenant> = Api::all(self.client.clone());
        let selector = format!("{}={}", TENANT_INVENTORY_NAMESPACE_FIELD, namespace);
        let tenants = match api.list(&ListParams::default().fields(&selector)).await {
            Ok(list) => list.items,
            Err(kube::Error::Api(ae)) if ae.code == HTTP_BAD_REQUEST => {
                debug!(selector = %selector, "field selector rejected, filtering client-side");
                api.list(&ListParams::default()).await?.items
            }
            Err(e) => return Err(e.into()),
        };
        Ok(tenants_for_namespace(tenants, namespace))
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        self.create(Api::namespaced(self.client.clone(), namespace), role)
            .await
    }

    async fn patch_role_rules(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        rules: &[PolicyRule],
    ) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        self.patch_field(api, name, resource_version, "rules", rules)
            .await
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        self.create(Api::namespaced(self.client.clone(), namespace), binding)
            .await
    }

    async fn patch_role_binding_subjects(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        subjects: &[Subject],
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        self.patch_field(api, name, resource_version, "subjects", subjects)
            .await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        self.delete(api, name).await
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<(), Error> {
        self.create(Api::all(self.client.clone()), role).await
    }

    async fn patch_cluster_role_rules(
        &self,
        name: &str,
        resource_version: Option<String>,
        rules: &[PolicyRule],
    ) -> Result<(), Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        self.patch_field(api, name, resource_version, "rules", rules)
            .await
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        self.create(Api::all(self.client.clone()), binding).await
    }

    async fn patch_cluster_role_binding_subjects(
        &self,
        name: &str,
        resource_version: Option<String>,
        subjects: &[Subject],
    ) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        self.patch_field(api, name, resource_version, "subjects", subjects)
            .await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        self.delete(api, name).await
    }
}
