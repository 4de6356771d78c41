//! DBaaSPolicy CRD: per-namespace defaults for inventories
//!
//! Several policies may exist in one namespace but only one is active at a
//! time. The active one carries `Ready=True`; the rest report
//! `ActivePolicyExists`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::selector::NamespaceSelector;
use super::types::{is_condition_true, Condition, CONDITION_READY};

/// Policy fields shared by DBaaSPolicy and the per-inventory overrides.
///
/// Every field is optional: `None` on an inventory means "inherit from the
/// active policy".
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPolicy {
    /// Forbid DBaaSInstance provisioning against the inventory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_provisions: Option<bool>,

    /// Namespaces allowed to create connections; `*` allows all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_namespaces: Option<Vec<String>>,

    /// Label selector for namespaces allowed to create connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_ns_selector: Option<NamespaceSelector>,
}

impl InventoryPolicy {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.disable_provisions.is_none()
            && self.connection_namespaces.is_none()
            && self.connection_ns_selector.is_none()
    }
}

/// Namespace-wide defaults for inventories.
///
/// Example:
/// ```yaml
/// apiVersion: dbaas.dev/v1beta1
/// kind: DBaaSPolicy
/// metadata:
///   name: default
///   namespace: dbaas-inventories
/// spec:
///   disableProvisions: false
///   connectionNamespaces: ["team-a", "team-b"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSPolicy",
    namespaced,
    status = "DBaaSPolicyStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSPolicySpec {
    /// Policy values applied to every inventory in the namespace
    #[serde(flatten)]
    pub policy: InventoryPolicy,
}

/// Observed state of a DBaaSPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSPolicyStatus {
    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DBaaSPolicy {
    /// True if this policy is the active one in its namespace
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY))
    }
}
