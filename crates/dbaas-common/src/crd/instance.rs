//! DBaaSInstance CRD: a database instance provisioned through an inventory

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespacedRef};

/// A new database instance requested from a provider.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSInstance",
    namespaced,
    status = "DBaaSInstanceStatus",
    printcolumn = r#"{"name":"Inventory","type":"string","jsonPath":".spec.inventoryRef.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSInstanceSpec {
    /// Inventory to provision through
    pub inventory_ref: NamespacedRef,

    /// Name of the instance at the provider
    pub name: String,

    /// Cloud the provider should place the instance in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,

    /// Region within the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_region: Option<String>,

    /// Provider-specific provisioning parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_instance_params: BTreeMap<String, String>,
}

/// Observed state of an instance, copied from the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSInstanceStatus {
    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Provider-assigned instance identifier
    #[serde(rename = "instanceID", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Provider-specific details
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_info: BTreeMap<String, String>,

    /// Provisioning phase reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}
