//! Kubernetes helpers shared by the DBaaS controllers
//!
//! Covers runtime kind resolution (`ApiResource` construction and
//! discovery), owner-reference lookups and API error classification.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, Resource};
use tracing::{debug, warn};

use crate::Error;

/// HTTP status returned for optimistic-concurrency failures
const HTTP_CONFLICT: u16 = 409;

/// HTTP status returned for missing objects
const HTTP_NOT_FOUND: u16 = 404;

/// True when the API server rejected a write with 409 Conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == HTTP_CONFLICT)
}

/// True when the API server reported the object as missing
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == HTTP_NOT_FOUND)
}

/// Split an apiVersion into `(group, version)`.
///
/// ```
/// use dbaas_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("dbaas.dev/v1beta1");
/// assert_eq!(group, "dbaas.dev");
/// assert_eq!(version, "v1beta1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind.
///
/// Provider kinds follow regular English rules, so the fallback covers them;
/// the table holds the irregular ones seen in practice.
pub fn pluralize_kind(kind: &str) -> String {
    const KIND_PLURALS: &[(&str, &str)] = &[
        ("dbaaspolicy", "dbaaspolicies"),
        ("dbaasinventory", "dbaasinventories"),
        ("endpoints", "endpoints"),
    ];

    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The plural is derived from the kind, which matches how provider CRDs are
/// conventionally named. Prefer a discovered resource when one is available.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Look up a resource in pre-computed API discovery results.
///
/// Returns `None` if the kind is not served (not an error).
pub fn find_discovered_resource(
    discovery: &Discovery,
    api_version: &str,
    kind: &str,
) -> Option<ApiResource> {
    let (group, version) = parse_api_version(api_version);
    for api_group in discovery.groups() {
        if api_group.name() != group {
            continue;
        }
        for (ar, _caps) in api_group.versioned_resources(&version) {
            if ar.kind == kind {
                debug!(
                    api_version = %api_version,
                    kind = %kind,
                    plural = %ar.plural,
                    "discovered backend kind"
                );
                return Some(ar);
            }
        }
    }
    warn!(api_version = %api_version, kind = %kind, "kind not found in API discovery");
    None
}

/// Run discovery for a single group and resolve `apiVersion/kind`.
pub async fn discover_api_resource(
    client: &Client,
    api_version: &str,
    kind: &str,
) -> Result<Option<ApiResource>, Error> {
    let (group, _) = parse_api_version(api_version);
    let discovery = Discovery::new(client.clone())
        .filter(&[group.as_str()])
        .run()
        .await
        .map_err(|e| {
            Error::internal_with_context("discovery", format!("API discovery failed: {}", e))
        })?;
    Ok(find_discovered_resource(&discovery, api_version, kind))
}

/// Type identifier for a runtime kind, used as the watch registry key
pub fn type_key(api_version: &str, kind: &str) -> String {
    format!("{}/{}", api_version, kind)
}

/// `namespace/name` for logs and error messages
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// The controller owner reference on an object, if any
pub fn controller_owner<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// True if `obj` is controlled by an owner of the given apiVersion/kind.
///
/// Only apiVersion group and kind are compared so a version bump on the
/// owner does not orphan existing children.
pub fn is_controlled_by(owner: &OwnerReference, api_version: &str, kind: &str) -> bool {
    let (owner_group, _) = parse_api_version(&owner.api_version);
    let (group, _) = parse_api_version(api_version);
    owner.kind == kind && owner_group == group
}

/// Build a controller owner reference for a typed resource.
///
/// Fails when the owner has not been persisted yet (no uid).
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference, Error>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        let meta = owner.meta();
        Error::validation(
            object_key(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default()),
            "owner has no uid",
        )
    })
}

/// Fetch the labels of a namespace
pub async fn namespace_labels(
    client: &Client,
    namespace: &str,
) -> Result<BTreeMap<String, String>, Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.get_opt(namespace).await? {
        Some(ns) => Ok(ns.metadata.labels.unwrap_or_default()),
        None => Ok(BTreeMap::new()),
    }
}
