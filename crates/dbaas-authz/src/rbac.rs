//! Read-only role artifacts for tenants and inventories
//!
//! Artifact names derive from the owning object's name and never change, so
//! convergence only ever patches rules or subjects.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef,
};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use dbaas_common::crd::{DBaaSInventory, DBaaSTenant};
use dbaas_common::kube_utils::controller_owner_ref;
use dbaas_common::{Error, DBAAS_GROUP, LABEL_MANAGED_BY, LABEL_MANAGED_BY_DBAAS};

use crate::subjects::AccessSubjectSet;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Plural resource name of inventories
pub const INVENTORY_RESOURCE: &str = "dbaasinventories";

/// Plural resource name of tenants
pub const TENANT_RESOURCE: &str = "dbaastenants";

/// The only verb a synthesized rule may carry
pub const ALLOWED_VERB: &str = "get";

/// Name of the ClusterRole and ClusterRoleBinding for a tenant
pub fn tenant_role_name(tenant: &str) -> String {
    format!("dbaas-tenant-{}-viewer", tenant)
}

/// Name of the Role and RoleBinding for an inventory
pub fn inventory_role_name(inventory: &str) -> String {
    format!("dbaas-inventory-{}-viewer", inventory)
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_DBAAS.to_string(),
    )])
}

fn get_rule(resources: &[&str], name: String) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![DBAAS_GROUP.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        resource_names: Some(vec![name]),
        verbs: vec!["get".to_string()],
        ..Default::default()
    }
}

/// ClusterRole granting `get` on one tenant
pub fn tenant_cluster_role(tenant: &DBaaSTenant) -> Result<ClusterRole, Error> {
    Ok(ClusterRole {
        metadata: ObjectMeta {
            name: Some(tenant_role_name(&tenant.name_any())),
            labels: Some(managed_labels()),
            owner_references: Some(vec![controller_owner_ref(tenant)?]),
            ..Default::default()
        },
        rules: Some(vec![get_rule(&[TENANT_RESOURCE], tenant.name_any())]),
        ..Default::default()
    })
}

/// ClusterRoleBinding of a tenant's ClusterRole to `subjects`
pub fn tenant_cluster_role_binding(
    tenant: &DBaaSTenant,
    subjects: &AccessSubjectSet,
) -> Result<ClusterRoleBinding, Error> {
    let name = tenant_role_name(&tenant.name_any());
    Ok(ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(managed_labels()),
            owner_references: Some(vec![controller_owner_ref(tenant)?]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(subjects.to_rbac_subjects()),
    })
}

/// Role granting `get` on one inventory and its status
pub fn inventory_role(inventory: &DBaaSInventory) -> Result<Role, Error> {
    Ok(Role {
        metadata: ObjectMeta {
            name: Some(inventory_role_name(&inventory.name_any())),
            namespace: inventory.namespace(),
            labels: Some(managed_labels()),
            owner_references: Some(vec![controller_owner_ref(inventory)?]),
            ..Default::default()
        },
        rules: Some(vec![get_rule(
            &[INVENTORY_RESOURCE, "dbaasinventories/status"],
            inventory.name_any(),
        )]),
    })
}

/// RoleBinding of an inventory's Role to `subjects`
pub fn inventory_role_binding(
    inventory: &DBaaSInventory,
    subjects: &AccessSubjectSet,
) -> Result<RoleBinding, Error> {
    let name = inventory_role_name(&inventory.name_any());
    Ok(RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: inventory.namespace(),
            labels: Some(managed_labels()),
            owner_references: Some(vec![controller_owner_ref(inventory)?]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name,
        },
        subjects: Some(subjects.to_rbac_subjects()),
    })
}

/// Refuse rules carrying any verb other than `get`.
///
/// Runs before every create or patch, independent of how the rules were
/// built.
pub fn check_rules(artifact: &str, rules: &[PolicyRule]) -> Result<(), Error> {
    let offending: Vec<&str> = rules
        .iter()
        .flat_map(|r| r.verbs.iter())
        .map(|v| v.as_str())
        .filter(|v| *v != ALLOWED_VERB)
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(
            artifact,
            format!("rules carry verbs other than get: {}", offending.join(", ")),
        ))
    }
}
