//! Cluster collaborator seam
//!
//! The orchestrator only talks to the cluster through [`ClusterClient`],
//! keeping the Kubernetes mechanics behind one trait. Retries, if any,
//! belong to implementations; callers treat every error as final.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::models::{ShadowEndpoint, ShadowSpec};

/// Cluster collaborator errors
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Creating or looking up the shadow workload failed
    #[error("failed to provision shadow workload: {0}")]
    ProvisionFailed(String),

    /// A read-side cluster query failed
    #[error("cluster query failed: {0}")]
    QueryFailed(String),

    /// No kubectl binary could be located
    #[error("kubectl binary not found")]
    KubectlNotFound,

    /// The cluster did not answer within the request timeout
    #[error("cluster request timed out")]
    Timeout,

    /// The cluster answered with something we could not parse
    #[error("failed to parse cluster response: {0}")]
    ParseFailed(String),

    /// Local I/O failure while talking to the cluster tooling
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the connect flow needs from the cluster.
///
/// `get_or_create_shadow` must be idempotent under a name key: concurrent
/// calls for the same name resolve to exactly one live workload, with all
/// callers observing that one. Read operations tolerate eventual
/// consistency.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Ensure a shadow workload named `name` exists and is reachable,
    /// returning its endpoint.
    async fn get_or_create_shadow(
        &self,
        name: &str,
        spec: &ShadowSpec,
    ) -> Result<ShadowEndpoint, ClusterError>;

    /// CIDR blocks the tunnel must route (pod and service networks).
    async fn cluster_cidrs(&self, namespace: &str) -> Result<Vec<String>, ClusterError>;

    /// Service name to address mapping for one namespace.
    async fn service_hosts(
        &self,
        namespace: &str,
    ) -> Result<HashMap<String, String>, ClusterError>;

    /// Delete the shadow workload. Missing workloads are not an error.
    async fn remove_shadow(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Delete the shadow's config artifact. Missing artifacts are not an
    /// error.
    async fn remove_config(&self, namespace: &str, config_ref: &str) -> Result<(), ClusterError>;
}
