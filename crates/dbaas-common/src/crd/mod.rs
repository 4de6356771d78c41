//! Custom Resource Definitions for the DBaaS control plane

mod connection;
mod instance;
mod inventory;
mod policy;
mod provider;
mod selector;
mod tenant;
mod types;

pub use connection::{DBaaSConnection, DBaaSConnectionSpec, DBaaSConnectionStatus};
pub use instance::{DBaaSInstance, DBaaSInstanceSpec, DBaaSInstanceStatus};
pub use inventory::{DBaaSInventory, DBaaSInventorySpec, DBaaSInventoryStatus, DatabaseService};
pub use policy::{DBaaSPolicy, DBaaSPolicySpec, DBaaSPolicyStatus, InventoryPolicy};
pub use provider::{
    CredentialField, DBaaSProvider, DBaaSProviderSpec, InstanceParameterSpec, ProviderInfo,
};
pub use selector::{LabelSelectorOperator, LabelSelectorRequirement, NamespaceSelector};
pub use tenant::{
    sort_oldest_first, tenants_for_namespace, DBaaSTenant, DBaaSTenantSpec,
    TENANT_INVENTORY_NAMESPACE_FIELD,
};
pub use types::{
    find_condition, is_condition_true, reasons, set_condition, Authz, Condition, ConditionStatus,
    FacadeKind, LocalObjectRef, NamespacedRef, ProviderRef, CONDITION_READY,
};
