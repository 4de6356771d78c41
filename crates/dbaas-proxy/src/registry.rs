//! Provider registration lookup and backend kind resolution
//!
//! Providers come and go at runtime. Registrations are read from a reflector
//! store when one is attached and populated, otherwise listed from the API.
//! Discovered `ApiResource`s are cached per type key since a served kind's
//! plural never changes while its CRD is installed.

use std::sync::Arc;

use dashmap::DashMap;
use kube::discovery::ApiResource;
use kube::runtime::reflector::Store;
use tracing::{debug, info};

use dbaas_common::crd::{DBaaSProvider, FacadeKind};
use dbaas_common::kube_utils::{build_api_resource, type_key};
use dbaas_common::Error;

use crate::client::ProxyKubeClient;

/// Maps provider names to registrations and backend kinds to `ApiResource`s
pub struct ProviderRegistry {
    kube: Arc<dyn ProxyKubeClient>,
    providers: Option<Store<DBaaSProvider>>,
    resources: DashMap<String, ApiResource>,
}

impl ProviderRegistry {
    /// Registry reading through the given client
    pub fn new(kube: Arc<dyn ProxyKubeClient>) -> Self {
        Self {
            kube,
            providers: None,
            resources: DashMap::new(),
        }
    }

    /// Serve registrations from a reflector store kept by the caller
    pub fn with_store(mut self, providers: Store<DBaaSProvider>) -> Self {
        self.providers = Some(providers);
        self
    }

    async fn registrations(&self) -> Result<Vec<Arc<DBaaSProvider>>, Error> {
        if let Some(cached) = self
            .providers
            .as_ref()
            .map(Store::state)
            .filter(|state| !state.is_empty())
        {
            return Ok(cached);
        }
        Ok(self
            .kube
            .list_providers()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect())
    }

    /// Find the registration for a provider name.
    ///
    /// When several registrations claim the same name the lexically first
    /// object name wins, so the choice is stable across reconciles.
    pub async fn provider(&self, name: &str, resource: &str) -> Result<DBaaSProvider, Error> {
        let mut matches: Vec<Arc<DBaaSProvider>> = self
            .registrations()
            .await?
            .into_iter()
            .filter(|p| p.registered_name() == name)
            .collect();
        matches.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        matches
            .first()
            .map(|p| p.as_ref().clone())
            .ok_or_else(|| Error::provider_not_found(name, resource))
    }

    /// Resolve the backend `ApiResource` a provider serves for a facade role.
    ///
    /// Falls back to a constructed resource (pluralized kind) when discovery
    /// does not know the kind yet; the fallback is not cached.
    pub async fn backend_resource(
        &self,
        provider: &DBaaSProvider,
        role: FacadeKind,
    ) -> Result<ApiResource, Error> {
        let api_version = provider.api_version();
        let kind = provider.kind_for(role);
        if kind.is_empty() {
            return Err(Error::validation(
                provider.registered_name(),
                format!("provider registers no {} kind", role),
            ));
        }

        let key = type_key(api_version, kind);
        if let Some(ar) = self.resources.get(&key) {
            return Ok(ar.clone());
        }

        match self.kube.discover_resource(api_version, kind).await? {
            Some(ar) => {
                info!(type_key = %key, plural = %ar.plural, "cached backend kind");
                self.resources.insert(key, ar.clone());
                Ok(ar)
            }
            None => {
                debug!(type_key = %key, "backend kind not discovered, using constructed resource");
                Ok(build_api_resource(api_version, kind))
            }
        }
    }
}
