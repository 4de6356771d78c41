//! Supporting types shared by the DBaaS CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type every facade, policy and inventory reports
pub const CONDITION_READY: &str = "Ready";

/// Machine-readable condition reasons written by the control plane
pub mod reasons {
    /// Resource is ready
    pub const READY: &str = "Ready";
    /// Facade references a provider with no DBaaSProvider registration
    pub const PROVIDER_NOT_FOUND: &str = "ProviderNotFound";
    /// Connection/instance references a missing inventory
    pub const INVENTORY_NOT_FOUND: &str = "InventoryNotFound";
    /// Referenced inventory exists but is not Ready
    pub const INVENTORY_NOT_READY: &str = "InventoryNotReady";
    /// Effective policy disables provisioning for the inventory
    pub const INVENTORY_NOT_PROVISIONABLE: &str = "InventoryNotProvisionable";
    /// Effective policy does not allow connections from this namespace
    pub const INVALID_CONNECTION_NAMESPACE: &str = "InvalidConnectionNamespace";
    /// Backend object exists but its controller has not reported status yet
    pub const BACKEND_PENDING: &str = "BackendPending";
    /// Another policy already governs the namespace
    pub const ACTIVE_POLICY_EXISTS: &str = "ActivePolicyExists";
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition state is not yet known
    #[default]
    Unknown,
}

/// Standard Kubernetes-style status condition
///
/// Backend controllers write conditions in the same shape, so facade status
/// decoding passes them through verbatim. `lastTransitionTime` is optional
/// because not every backend sets it.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Shorthand for a `Ready` condition
    pub fn ready(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self::new(CONDITION_READY, status, reason, message)
    }
}

/// Insert or replace a condition by type.
///
/// The existing transition time is kept when the status does not change, so
/// re-deriving the same condition on every reconcile produces an identical
/// condition list. Returns true when the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True if a condition of the given type exists with status `True`
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Reference to a registered provider by its registration name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProviderRef {
    /// Provider name (`DBaaSProvider.spec.provider.name`)
    pub name: String,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectRef {
    /// Object name
    pub name: String,
}

/// Reference to an object that may live in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NamespacedRef {
    /// Object name
    pub name: String,

    /// Object namespace; defaults to the referencing object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedRef {
    /// Resolve the namespace, falling back to the referencing object's
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Users and groups declared for default access
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Authz {
    /// User names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    /// Group names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl Authz {
    /// True when neither users nor groups are declared
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }
}

/// The role a facade plays. Each role proxies to a different backend kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FacadeKind {
    /// Provider account / inventory of database services
    Inventory,
    /// Connection to an existing database service
    Connection,
    /// Newly provisioned database instance
    Instance,
}

impl FacadeKind {
    /// All roles, in dependency order
    pub const ALL: [FacadeKind; 3] = [Self::Inventory, Self::Connection, Self::Instance];
}

impl std::fmt::Display for FacadeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inventory => write!(f, "inventory"),
            Self::Connection => write!(f, "connection"),
            Self::Instance => write!(f, "instance"),
        }
    }
}
