//! DBaaSConnection CRD: binding to an existing database service

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LocalObjectRef, NamespacedRef};

/// A connection to a database service exposed by an inventory.
///
/// The inventory may live in another namespace when its effective policy
/// allows connections from this one.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSConnection",
    namespaced,
    status = "DBaaSConnectionStatus",
    printcolumn = r#"{"name":"Inventory","type":"string","jsonPath":".spec.inventoryRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSConnectionSpec {
    /// Inventory exposing the database service
    pub inventory_ref: NamespacedRef,

    /// Provider-assigned identifier of the database service
    #[serde(rename = "databaseServiceID")]
    pub database_service_id: String,

    /// Display name of the database service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_service_name: Option<String>,

    /// Type of the database service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_service_type: Option<String>,
}

/// Observed state of a connection, copied from the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSConnectionStatus {
    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Secret holding the connection credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<LocalObjectRef>,

    /// ConfigMap holding host/port/database details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info_ref: Option<LocalObjectRef>,
}
