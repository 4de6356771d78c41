//! DBaaS operator - controller wiring, configuration and CRD manifests

pub mod config;
pub mod controller_runner;
pub mod crds;
