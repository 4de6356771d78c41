//! Common types for the DBaaS control plane: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for every DBaaS custom resource
pub const DBAAS_GROUP: &str = "dbaas.dev";

/// Served version of the DBaaS custom resources
pub const DBAAS_VERSION: &str = "v1beta1";

/// Full apiVersion string for DBaaS custom resources
pub const DBAAS_API_VERSION: &str = "dbaas.dev/v1beta1";

/// Field manager used for every write issued by the operator
pub const FIELD_MANAGER: &str = "dbaas-operator";

/// Standard Kubernetes label recording which tool manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for resources created by this operator
pub const LABEL_MANAGED_BY_DBAAS: &str = "dbaas-operator";
