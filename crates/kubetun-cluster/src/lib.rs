//! Cluster-side collaborators for kubetun
//!
//! Defines the shadow workload data model, the [`ClusterClient`] seam the
//! orchestrator talks to, a kubectl-exec implementation of that seam, and
//! the shadow provisioning policy (naming, labels, idempotent reuse).

pub mod client;
pub mod kubectl;
pub mod models;
pub mod shadow;

pub use client::{ClusterClient, ClusterError};
pub use kubectl::KubectlClient;
pub use models::{NameSuffix, ShadowEndpoint, ShadowSpec, SshCredential, WorkloadId};
pub use shadow::{get_or_create_shadow, shadow_labels, ProvisionRequest};
