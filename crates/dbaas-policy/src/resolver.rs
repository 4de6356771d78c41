//! Active policy selection and per-inventory policy merging

use std::cmp::Ordering;
use std::collections::BTreeMap;

use dbaas_common::crd::{DBaaSInventory, DBaaSPolicy, NamespaceSelector};
use kube::ResourceExt;

/// Wildcard entry in `connectionNamespaces` allowing every namespace
pub const ALL_NAMESPACES: &str = "*";

fn creation_order(a: &DBaaSPolicy, b: &DBaaSPolicy) -> Ordering {
    let ts = |p: &DBaaSPolicy| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
    ts(a).cmp(&ts(b)).then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Sort policies oldest first, ties broken by name
pub fn sort_policies(policies: &mut [DBaaSPolicy]) {
    policies.sort_by(creation_order);
}

/// Pick the policy governing a namespace.
///
/// The first policy (in creation order) already marked `Ready=True` keeps the
/// role. When none is marked, the oldest remaining policy takes over. Returns
/// `None` only for an empty list.
pub fn resolve_active_policy(policies: &[DBaaSPolicy]) -> Option<&DBaaSPolicy> {
    let mut ordered: Vec<&DBaaSPolicy> = policies.iter().collect();
    ordered.sort_by(|a, b| creation_order(a, b));

    ordered
        .iter()
        .find(|p| p.is_active())
        .or_else(|| ordered.first())
        .copied()
}

/// Policy in force for one inventory after applying its overrides
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EffectivePolicy {
    /// Namespaces allowed to connect; `None` means the inventory's own only
    pub connection_namespaces: Option<Vec<String>>,
    /// Selector for namespaces allowed to connect
    pub connection_ns_selector: Option<NamespaceSelector>,
    /// Whether DBaaSInstance provisioning is forbidden
    pub disable_provisions: bool,
}

/// Merge an inventory's overrides over the namespace's active policy.
///
/// Each field is resolved independently: an inventory value wins, an unset
/// one inherits from the policy.
pub fn resolve_effective_policy(
    inventory: &DBaaSInventory,
    active: Option<&DBaaSPolicy>,
) -> EffectivePolicy {
    let overrides = &inventory.spec.policy;
    let defaults = active.map(|p| &p.spec.policy);

    EffectivePolicy {
        connection_namespaces: overrides
            .connection_namespaces
            .clone()
            .or_else(|| defaults.and_then(|d| d.connection_namespaces.clone())),
        connection_ns_selector: overrides
            .connection_ns_selector
            .clone()
            .or_else(|| defaults.and_then(|d| d.connection_ns_selector.clone())),
        disable_provisions: overrides
            .disable_provisions
            .or_else(|| defaults.and_then(|d| d.disable_provisions))
            .unwrap_or(false),
    }
}

impl EffectivePolicy {
    /// True if `connection_ns` is allowed without looking at namespace labels
    pub fn allows_by_name(&self, inventory_ns: &str, connection_ns: &str) -> bool {
        inventory_ns == connection_ns
            || self
                .connection_namespaces
                .as_ref()
                .is_some_and(|list| list.iter().any(|n| n == ALL_NAMESPACES || n == connection_ns))
            || self
                .connection_ns_selector
                .as_ref()
                .is_some_and(|s| s.is_empty())
    }

    /// True if deciding requires the connection namespace's labels
    pub fn needs_namespace_labels(&self, inventory_ns: &str, connection_ns: &str) -> bool {
        !self.allows_by_name(inventory_ns, connection_ns) && self.connection_ns_selector.is_some()
    }

    /// Whether a connection in `connection_ns` may use the inventory
    pub fn is_namespace_allowed(
        &self,
        inventory_ns: &str,
        connection_ns: &str,
        namespace_labels: &BTreeMap<String, String>,
    ) -> bool {
        self.allows_by_name(inventory_ns, connection_ns)
            || self
                .connection_ns_selector
                .as_ref()
                .is_some_and(|s| s.matches(namespace_labels))
    }
}
