//! CRD manifests for every DBaaS kind

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::info;

use dbaas_common::crd::{
    DBaaSConnection, DBaaSInstance, DBaaSInventory, DBaaSPolicy, DBaaSProvider, DBaaSTenant,
};
use dbaas_common::retry::{retry_with_backoff, RetryConfig};

/// Every CRD the operator serves
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        DBaaSProvider::crd(),
        DBaaSTenant::crd(),
        DBaaSPolicy::crd(),
        DBaaSInventory::crd(),
        DBaaSConnection::crd(),
        DBaaSInstance::crd(),
    ]
}

/// All CRDs as one multi-document YAML stream
pub fn render_crds() -> Result<String, serde_yaml::Error> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

/// Attempts per CRD before startup gives up
const CRD_APPLY_ATTEMPTS: u32 = 5;

/// Server-side apply every CRD so served schemas match this build
pub async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let retry = RetryConfig::with_max_attempts(CRD_APPLY_ATTEMPTS);
    apply_crds(all_crds(), &retry, |crd| {
        let api = api.clone();
        let params = params.clone();
        async move {
            let name = crd.name_any();
            api.patch(&name, &params, &Patch::Apply(&crd)).await
        }
    })
    .await
}

/// Run `apply` for each CRD in order, retrying each one with backoff
async fn apply_crds<F, Fut, T, E>(
    crds: Vec<CustomResourceDefinition>,
    retry: &RetryConfig,
    apply: F,
) -> anyhow::Result<()>
where
    F: Fn(CustomResourceDefinition) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for crd in crds {
        let name = crd.name_any();
        info!(crd = %name, "applying CRD");
        retry_with_backoff(retry, "apply_crd", || apply(crd.clone()))
            .await
            .map_err(|e| anyhow::anyhow!("failed to apply CRD {}: {}", name, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_in_the_dbaas_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 6);
        for crd in &crds {
            assert_eq!(crd.spec.group, dbaas_common::DBAAS_GROUP);
            assert!(crd.name_any().ends_with(".dbaas.dev"));
        }
    }

    #[test]
    fn scopes_match_the_data_model() {
        let scope = |kind: &str| {
            all_crds()
                .into_iter()
                .find(|c| c.spec.names.kind == kind)
                .map(|c| c.spec.scope)
                .unwrap()
        };
        assert_eq!(scope("DBaaSProvider"), "Cluster");
        assert_eq!(scope("DBaaSTenant"), "Cluster");
        assert_eq!(scope("DBaaSPolicy"), "Namespaced");
        assert_eq!(scope("DBaaSConnection"), "Namespaced");
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_apply_failures_are_retried() {
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen = calls.clone();
        apply_crds(all_crds(), &fast_retry(3), move |crd| {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock().unwrap();
                let first_try = !seen.contains(&crd.name_any());
                seen.push(crd.name_any());
                if first_try {
                    Err("connection reset")
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn persistent_failure_names_the_crd() {
        let err = apply_crds(all_crds(), &fast_retry(2), |_| async {
            Err::<(), _>("forbidden")
        })
        .await
        .unwrap_err()
        .to_string();
        assert!(err.contains("dbaasproviders.dbaas.dev"));
        assert!(err.contains("forbidden"));
    }

    #[test]
    fn rendered_stream_has_one_document_per_crd() {
        let yaml = render_crds().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 6);
        assert_eq!(yaml.matches("---\n").count(), 5);
    }
}
