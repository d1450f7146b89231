//! Pod resolution: registered address → cluster pod identity.
//!
//! The registry stores a transient pod IP, not a stable handle. Addresses
//! are reused across pod churn, so identity is re-derived on every lookup
//! and never cached beyond the job that asked.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use thiserror::Error;
use tracing::debug;

/// Errors from cluster queries.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The cluster API could not be reached or rejected the call.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// No pod in the namespace currently holds the address. Can also be
    /// a race between the registry write and pod network readiness; the
    /// caller owns any retry policy.
    #[error("no pod in namespace {namespace} has address {address}")]
    NoMatch { namespace: String, address: String },
}

/// A pod identity derived from a cluster query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub address: Option<String>,
}

/// Cluster queries the coordinator and viewer need.
#[async_trait]
pub trait PodLocator: Send + Sync {
    /// Find the unique pod whose observed address matches.
    async fn pod_by_address(&self, address: &str) -> Result<PodRef, ResolveError>;

    /// List worker pods matching the farm's label selector.
    async fn list_workers(&self) -> Result<Vec<PodRef>, ResolveError>;

    /// Delete a named pod.
    async fn delete_pod(&self, name: &str) -> Result<(), ResolveError>;
}

/// [`PodLocator`] backed by the Kubernetes API.
pub struct KubePodLocator {
    pods: Api<Pod>,
    namespace: String,
    selector: String,
}

impl KubePodLocator {
    /// Scope a locator to one namespace and worker label selector.
    #[must_use]
    pub fn new(client: Client, namespace: &str, selector: impl Into<String>) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl PodLocator for KubePodLocator {
    async fn pod_by_address(&self, address: &str) -> Result<PodRef, ResolveError> {
        let params = ListParams::default().fields(&format!("status.podIP={address}"));
        let matches = self.pods.list(&params).await?;

        let pod = matches
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoMatch {
                namespace: self.namespace.clone(),
                address: address.to_string(),
            })?;

        let name = pod.metadata.name.ok_or_else(|| ResolveError::NoMatch {
            namespace: self.namespace.clone(),
            address: address.to_string(),
        })?;
        debug!(pod = %name, address = %address, "resolved address to pod");

        Ok(PodRef {
            name,
            address: Some(address.to_string()),
        })
    }

    async fn list_workers(&self) -> Result<Vec<PodRef>, ResolveError> {
        let params = ListParams::default().labels(&self.selector);
        let pods = self.pods.list(&params).await?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let address = pod.status.and_then(|s| s.pod_ip);
                pod.metadata.name.map(|name| PodRef { name, address })
            })
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ResolveError> {
        self.pods.delete(name, &DeleteParams::default()).await?;
        debug!(pod = %name, "deleted worker pod");
        Ok(())
    }
}
