//! The three facade kinds behind one trait

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use dbaas_common::crd::{
    Condition, DBaaSConnection, DBaaSConnectionStatus, DBaaSInstance, DBaaSInstanceStatus,
    DBaaSInventory, DBaaSInventoryStatus, FacadeKind, NamespacedRef, ProviderRef,
};
use dbaas_common::Error;

/// A provider-neutral resource proxied to a provider-specific backend kind
pub trait Facade:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Typed status decoded from the backend
    type Status: Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Which backend kind of a provider this facade maps to
    const ROLE: FacadeKind;

    /// The spec as JSON, copied verbatim into the backend
    fn spec_value(&self) -> Result<serde_json::Value, Error>;

    /// Current status, if any
    fn status(&self) -> Option<&Self::Status>;

    /// Mutable conditions of a status
    fn conditions_mut(status: &mut Self::Status) -> &mut Vec<Condition>;

    /// Provider named directly on the facade (inventories only)
    fn provider_ref(&self) -> Option<&ProviderRef> {
        None
    }

    /// Inventory the facade depends on (connections and instances)
    fn inventory_ref(&self) -> Option<&NamespacedRef> {
        None
    }
}

fn spec_json<T: Serialize>(kind: &str, spec: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(spec).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

impl Facade for DBaaSInventory {
    type Status = DBaaSInventoryStatus;
    const ROLE: FacadeKind = FacadeKind::Inventory;

    fn spec_value(&self) -> Result<serde_json::Value, Error> {
        spec_json("DBaaSInventory", &self.spec)
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn conditions_mut(status: &mut Self::Status) -> &mut Vec<Condition> {
        &mut status.conditions
    }

    fn provider_ref(&self) -> Option<&ProviderRef> {
        Some(&self.spec.provider_ref)
    }
}

impl Facade for DBaaSConnection {
    type Status = DBaaSConnectionStatus;
    const ROLE: FacadeKind = FacadeKind::Connection;

    fn spec_value(&self) -> Result<serde_json::Value, Error> {
        spec_json("DBaaSConnection", &self.spec)
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn conditions_mut(status: &mut Self::Status) -> &mut Vec<Condition> {
        &mut status.conditions
    }

    fn inventory_ref(&self) -> Option<&NamespacedRef> {
        Some(&self.spec.inventory_ref)
    }
}

impl Facade for DBaaSInstance {
    type Status = DBaaSInstanceStatus;
    const ROLE: FacadeKind = FacadeKind::Instance;

    fn spec_value(&self) -> Result<serde_json::Value, Error> {
        spec_json("DBaaSInstance", &self.spec)
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn conditions_mut(status: &mut Self::Status) -> &mut Vec<Condition> {
        &mut status.conditions
    }

    fn inventory_ref(&self) -> Option<&NamespacedRef> {
        Some(&self.spec.inventory_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbaas_common::crd::DBaaSConnectionSpec;

    #[test]
    fn connection_spec_round_trips_through_json() {
        let conn = DBaaSConnection::new(
            "orders",
            DBaaSConnectionSpec {
                inventory_ref: NamespacedRef {
                    name: "inv1".to_string(),
                    namespace: Some("inv-ns".to_string()),
                },
                database_service_id: "svc-1".to_string(),
                database_service_name: Some("orders".to_string()),
                database_service_type: None,
            },
        );

        let value = conn.spec_value().unwrap();
        assert_eq!(value["databaseServiceID"], "svc-1");
        assert_eq!(value["inventoryRef"]["namespace"], "inv-ns");

        let back: DBaaSConnectionSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, conn.spec);
    }

    #[test]
    fn roles_and_references() {
        assert_eq!(DBaaSInventory::ROLE, FacadeKind::Inventory);
        assert_eq!(DBaaSConnection::ROLE, FacadeKind::Connection);
        assert_eq!(DBaaSInstance::ROLE, FacadeKind::Instance);
    }
}
