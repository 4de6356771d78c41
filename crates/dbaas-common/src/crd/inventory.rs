//! DBaaSInventory CRD: a provider account and the services it exposes

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::policy::InventoryPolicy;
use super::types::{is_condition_true, Authz, Condition, LocalObjectRef, ProviderRef, CONDITION_READY};

/// A provider account imported into a namespace.
///
/// Example:
/// ```yaml
/// apiVersion: dbaas.dev/v1beta1
/// kind: DBaaSInventory
/// metadata:
///   name: crunchy-prod
///   namespace: dbaas-inventories
/// spec:
///   providerRef:
///     name: crunchy-bridge
///   credentialsRef:
///     name: crunchy-prod-credentials
///   connectionNamespaces: ["*"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSInventory",
    namespaced,
    status = "DBaaSInventoryStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.providerRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSInventorySpec {
    /// Provider backing this inventory
    pub provider_ref: ProviderRef,

    /// Secret holding the provider account credentials
    pub credentials_ref: LocalObjectRef,

    /// Users and groups granted read access to this inventory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<Authz>,

    /// Overrides of the namespace's active policy
    #[serde(flatten)]
    pub policy: InventoryPolicy,
}

/// Observed state of an inventory, copied from the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSInventoryStatus {
    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Database services discovered in the provider account
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub database_services: Vec<DatabaseService>,
}

/// A database service offered by an inventory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseService {
    /// Provider-assigned identifier
    #[serde(rename = "serviceID")]
    pub service_id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Service type (e.g. `instance`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Provider-specific details
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_info: BTreeMap<String, String>,
}

impl DBaaSInventory {
    /// True if the inventory reports `Ready=True`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY))
    }

    /// Users and groups declared on the inventory, if any
    pub fn declared_authz(&self) -> Option<&Authz> {
        self.spec.authz.as_ref().filter(|a| !a.is_empty())
    }
}
