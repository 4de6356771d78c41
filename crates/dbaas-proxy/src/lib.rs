//! Facade proxy reconciliation
//!
//! Users create provider-neutral facades (DBaaSInventory, DBaaSConnection,
//! DBaaSInstance). Each facade is mirrored into a provider-specific backend
//! object whose kind is only known at runtime from the provider's
//! DBaaSProvider registration. The backend's status flows back to the facade.

#![deny(missing_docs)]

pub mod client;
pub mod facade;
pub mod reconciler;
pub mod registry;
pub mod watch;

pub use client::{ProxyKubeClient, ProxyKubeClientImpl};
pub use facade::Facade;
pub use reconciler::{error_policy, reconcile, ProxyContext};
pub use registry::ProviderRegistry;
pub use watch::{
    dependents_of_inventory, dependents_of_namespace, dependents_of_policy, owning_facade,
    WatchRegistrar,
};
