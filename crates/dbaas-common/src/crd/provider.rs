//! DBaaSProvider CRD: registration of a pluggable database provider
//!
//! Provider operators install one DBaaSProvider per backend. It names the
//! backend kinds the facades proxy to, so the facade controllers can resolve
//! them at runtime without a restart.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::FacadeKind;
use crate::DBAAS_API_VERSION;

/// Registration of a provider backend and the kinds it serves.
///
/// Example:
/// ```yaml
/// apiVersion: dbaas.dev/v1beta1
/// kind: DBaaSProvider
/// metadata:
///   name: crunchy-bridge-registration
/// spec:
///   provider:
///     name: crunchy-bridge
///     displayName: Crunchy Bridge
///   groupVersion: crunchybridge.example.com/v1alpha1
///   inventoryKind: CrunchyBridgeInventory
///   connectionKind: CrunchyBridgeConnection
///   instanceKind: CrunchyBridgeInstance
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.dev",
    version = "v1beta1",
    kind = "DBaaSProvider",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider.name"}"#,
    printcolumn = r#"{"name":"Inventory","type":"string","jsonPath":".spec.inventoryKind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DBaaSProviderSpec {
    /// Identity of the provider
    pub provider: ProviderInfo,

    /// apiVersion of the backend kinds; defaults to `dbaas.dev/v1beta1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_version: Option<String>,

    /// Backend kind proxied by DBaaSInventory
    pub inventory_kind: String,

    /// Backend kind proxied by DBaaSConnection
    pub connection_kind: String,

    /// Backend kind proxied by DBaaSInstance
    pub instance_kind: String,

    /// Credential fields the provider expects in an inventory's secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_fields: Vec<CredentialField>,

    /// Parameters accepted by DBaaSInstance.spec.otherInstanceParams
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_parameter_specs: Vec<InstanceParameterSpec>,
}

/// Provider identity and display metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Name facades use in `providerRef`
    pub name: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_description: Option<String>,
}

/// A credential key expected by the provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialField {
    /// Key inside the credentials secret
    pub key: String,

    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Field type hint (e.g. `string`, `maskedstring`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Whether the key must be present
    #[serde(default)]
    pub required: bool,
}

/// A provisioning parameter accepted by the provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceParameterSpec {
    /// Parameter name
    pub name: String,

    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Parameter type hint
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Whether the parameter must be set
    #[serde(default)]
    pub required: bool,

    /// Value used when the parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl DBaaSProvider {
    /// Name facades use to reference this provider.
    ///
    /// Falls back to the object name when `spec.provider.name` is blank.
    pub fn registered_name(&self) -> String {
        if self.spec.provider.name.is_empty() {
            self.name_any()
        } else {
            self.spec.provider.name.clone()
        }
    }

    /// apiVersion of the backend kinds
    pub fn api_version(&self) -> &str {
        self.spec
            .group_version
            .as_deref()
            .filter(|gv| !gv.is_empty())
            .unwrap_or(DBAAS_API_VERSION)
    }

    /// Backend kind for a facade role
    pub fn kind_for(&self, role: FacadeKind) -> &str {
        match role {
            FacadeKind::Inventory => &self.spec.inventory_kind,
            FacadeKind::Connection => &self.spec.connection_kind,
            FacadeKind::Instance => &self.spec.instance_kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> DBaaSProviderSpec {
        DBaaSProviderSpec {
            provider: ProviderInfo {
                name: "crunchy".to_string(),
                display_name: Some("Crunchy Bridge".to_string()),
                display_description: None,
            },
            group_version: Some("crunchy.example.com/v1alpha1".to_string()),
            inventory_kind: "CrunchyInventory".to_string(),
            connection_kind: "CrunchyConnection".to_string(),
            instance_kind: "CrunchyInstance".to_string(),
            credential_fields: vec![],
            instance_parameter_specs: vec![],
        }
    }

    #[test]
    fn kind_for_each_role() {
        let provider = DBaaSProvider::new("reg", sample_spec());
        assert_eq!(provider.kind_for(FacadeKind::Inventory), "CrunchyInventory");
        assert_eq!(provider.kind_for(FacadeKind::Connection), "CrunchyConnection");
        assert_eq!(provider.kind_for(FacadeKind::Instance), "CrunchyInstance");
        assert_eq!(provider.api_version(), "crunchy.example.com/v1alpha1");
    }

    #[test]
    fn registered_name_falls_back_to_object_name() {
        let mut spec = sample_spec();
        spec.provider.name = String::new();
        spec.group_version = None;
        let provider = DBaaSProvider::new("reg", spec);
        assert_eq!(provider.registered_name(), "reg");
        assert_eq!(provider.api_version(), DBAAS_API_VERSION);
    }

    #[test]
    fn parses_yaml_registration() {
        let yaml = r#"
provider:
  name: mongo
groupVersion: mongo.example.com/v1
inventoryKind: MongoInventory
connectionKind: MongoConnection
instanceKind: MongoInstance
credentialFields:
  - key: apiKey
    type: maskedstring
    required: true
"#;
        let spec: DBaaSProviderSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.provider.name, "mongo");
        assert_eq!(spec.credential_fields.len(), 1);
        assert!(spec.credential_fields[0].required);
    }
}
