//! DBaaSPolicy arbitration and effective policy resolution
//!
//! A namespace may hold several DBaaSPolicy objects but only one governs it.
//! [`resolver`] picks that policy and merges it with per-inventory overrides;
//! [`controller`] keeps the `Ready` conditions of every policy in a namespace
//! consistent with the choice.

#![deny(missing_docs)]

pub mod controller;
pub mod resolver;

pub use controller::{error_policy, reconcile, sibling_policies, PolicyContext, PolicyKubeClient};
pub use resolver::{resolve_active_policy, resolve_effective_policy, sort_policies, EffectivePolicy};
