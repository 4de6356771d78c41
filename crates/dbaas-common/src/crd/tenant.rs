//! DBaaSTenant CRD: default access for an inventory namespace

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Authz;

/// Field path used to look up tenants by inventory namespace
pub const TENANT_INVENTORY_NAMESPACE_FIELD: &str = "spec.inventoryNamespace";

/// Claims an inventory namespace and declares who may read its inventories.
///
/// Inventories without their own `authz` inherit the tenant's.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSTenant",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.inventoryNamespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSTenantSpec {
    /// Namespace holding the tenant's inventories
    pub inventory_namespace: String,

    /// Default users and groups for inventories in that namespace
    #[serde(default)]
    pub authz: Authz,
}

/// Keep only the tenants that claim `namespace`, oldest first.
///
/// Used when the API server does not support the field selector.
pub fn tenants_for_namespace(tenants: Vec<DBaaSTenant>, namespace: &str) -> Vec<DBaaSTenant> {
    let mut claimed: Vec<DBaaSTenant> = tenants
        .into_iter()
        .filter(|t| t.spec.inventory_namespace == namespace)
        .collect();
    sort_oldest_first(&mut claimed);
    claimed
}

/// Sort tenants by creation timestamp, then name
pub fn sort_oldest_first(tenants: &mut [DBaaSTenant]) {
    tenants.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}
