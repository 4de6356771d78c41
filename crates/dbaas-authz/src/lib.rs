//! Authorization synthesis for DBaaS namespaces
//!
//! Derives who may read tenants and inventories from live access reviews and
//! converges Role/ClusterRole grants that carry nothing beyond `get`.

#![deny(missing_docs)]

pub mod client;
pub mod rbac;
pub mod review;
pub mod subjects;
pub mod synthesizer;

pub use client::{AuthzKubeClient, AuthzKubeClientImpl};
pub use review::{AccessReviewer, KubeAccessReviewer, ResourceAttributes};
pub use subjects::{AccessSubject, AccessSubjectSet, SubjectKind};
pub use synthesizer::{
    error_policy, namespace_of_inventory, namespace_of_rbac, namespace_of_tenant, reconcile,
    synthesize_role_artifacts, AuthzContext, InventoryGrant, RoleArtifacts, TenantGrant,
};
