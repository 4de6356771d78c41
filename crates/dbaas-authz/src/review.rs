//! Access review queries
//!
//! Asks the API server who may perform a verb on a resource, using the
//! OpenShift `LocalResourceAccessReview` (namespaced) and
//! `ResourceAccessReview` (cluster) kinds.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::{ObjectMeta, TypeMeta};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use dbaas_common::Error;

use crate::subjects::AccessSubjectSet;

const REVIEW_GROUP: &str = "authorization.openshift.io";
const REVIEW_VERSION: &str = "v1";
const LOCAL_REVIEW_KIND: &str = "LocalResourceAccessReview";
const CLUSTER_REVIEW_KIND: &str = "ResourceAccessReview";

/// What an access review asks about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceAttributes {
    /// Verb, e.g. `get`
    pub verb: String,
    /// API group of the resource; empty for the core group
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// Namespace; `None` for a cluster-wide review
    pub namespace: Option<String>,
    /// Single object name, for per-object grants
    pub name: Option<String>,
}

impl ResourceAttributes {
    /// Review of a verb on a resource within a namespace
    pub fn namespaced(verb: &str, group: &str, resource: &str, namespace: &str) -> Self {
        Self {
            verb: verb.to_string(),
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: Some(namespace.to_string()),
            name: None,
        }
    }

    /// Review of a verb on a resource across the cluster
    pub fn cluster(verb: &str, group: &str, resource: &str) -> Self {
        Self {
            verb: verb.to_string(),
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: None,
            name: None,
        }
    }

    /// Narrow the review to one object
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "verb": self.verb,
            "resourceAPIGroup": self.group,
            "resource": self.resource,
        });
        if let Some(name) = &self.name {
            body["resourceName"] = serde_json::json!(name);
        }
        if let Some(namespace) = &self.namespace {
            body["namespace"] = serde_json::json!(namespace);
        }
        body
    }
}

/// Answers "who may do this" questions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Subjects authorized for the given attributes
    async fn review(&self, attrs: &ResourceAttributes) -> Result<AccessSubjectSet, Error>;
}

/// [`AccessReviewer`] backed by the OpenShift access review API
pub struct KubeAccessReviewer {
    client: Client,
}

impl KubeAccessReviewer {
    /// Reviewer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn review_resource(kind: &str) -> ApiResource {
    ApiResource {
        group: REVIEW_GROUP.to_string(),
        version: REVIEW_VERSION.to_string(),
        api_version: format!("{}/{}", REVIEW_GROUP, REVIEW_VERSION),
        kind: kind.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    }
}

/// Subjects listed in a review response
fn subjects_from_response(data: &serde_json::Value) -> AccessSubjectSet {
    let names = |field: &str| -> Vec<String> {
        data.get(field)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    AccessSubjectSet::from_review(names("users"), names("groups"))
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review(&self, attrs: &ResourceAttributes) -> Result<AccessSubjectSet, Error> {
        let (ar, api) = match &attrs.namespace {
            Some(ns) => {
                let ar = review_resource(LOCAL_REVIEW_KIND);
                let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
                (ar, api)
            }
            None => {
                let ar = review_resource(CLUSTER_REVIEW_KIND);
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                (ar, api)
            }
        };

        let request = DynamicObject {
            types: Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            }),
            metadata: ObjectMeta::default(),
            data: attrs.body(),
        };
        let response = api.create(&PostParams::default(), &request).await?;
        let subjects = subjects_from_response(&response.data);
        debug!(
            verb = %attrs.verb,
            resource = %attrs.resource,
            namespace = ?attrs.namespace,
            name = ?attrs.name,
            subjects = subjects.len(),
            "access review answered"
        );
        Ok(subjects)
    }
}
