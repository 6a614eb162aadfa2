//! kubectl-exec implementation of the cluster seam
//!
//! Shells out to kubectl rather than embedding a Kubernetes API client:
//! the cluster's auth, kubeconfig resolution, and retry behavior stay
//! where the user already manages them. All JSON comes back through
//! `-o json` and is parsed with minimal serde models.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::client::{ClusterClient, ClusterError};
use crate::models::{ShadowEndpoint, ShadowSpec, SshCredential, LABEL_NAME};

/// Well-known kubectl locations, probed before falling back to PATH.
const KUBECTL_PATHS: &[&str] = &[
    "/opt/homebrew/bin/kubectl",
    "/usr/local/bin/kubectl",
    "/usr/bin/kubectl",
];

/// Timeout for a single kubectl invocation.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the shadow pod to come up.
const SHADOW_READY_TIMEOUT: Duration = Duration::from_secs(120);
const SHADOW_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// User the shadow image accepts tunnel logins as.
const SHADOW_SSH_USER: &str = "root";

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Service {
    metadata: Metadata,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    // Kubernetes capitalizes the IP acronym, which rename_all = camelCase
    // would not produce.
    #[serde(default, rename = "clusterIP")]
    cluster_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[allow(dead_code)]
    metadata: Metadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    spec: NodeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSpec {
    #[serde(default, rename = "podCIDR")]
    pod_cidr: Option<String>,
    #[serde(default = "Vec::new", rename = "podCIDRs")]
    pod_cidrs: Vec<String>,
}

/// [`ClusterClient`] backed by the kubectl binary.
pub struct KubectlClient {
    kubectl_path: PathBuf,
    /// Directory holding locally generated shadow SSH keys
    key_dir: PathBuf,
}

impl KubectlClient {
    /// Locate kubectl and bind the client to `key_dir` for key material.
    pub fn discover(key_dir: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let kubectl_path = KUBECTL_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            // Fall back to PATH resolution at spawn time
            .unwrap_or_else(|| PathBuf::from("kubectl"));
        Ok(Self {
            kubectl_path,
            key_dir: key_dir.into(),
        })
    }

    pub fn with_paths(kubectl_path: impl Into<PathBuf>, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            kubectl_path: kubectl_path.into(),
            key_dir: key_dir.into(),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, ClusterError> {
        self.run(Command::new(&self.kubectl_path).args(args), None)
            .await
    }

    async fn kubectl_apply(&self, manifest: &serde_json::Value) -> Result<String, ClusterError> {
        self.run(
            Command::new(&self.kubectl_path).args(["apply", "-f", "-"]),
            Some(manifest.to_string()),
        )
        .await
    }

    async fn run(
        &self,
        command: &mut Command,
        stdin: Option<String>,
    ) -> Result<String, ClusterError> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let result = timeout(KUBECTL_TIMEOUT, async {
            let mut child = command.spawn()?;
            if let Some(input) = stdin {
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.shutdown().await?;
                }
            }
            child.wait_with_output().await
        })
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => String::from_utf8(output.stdout)
                .map_err(|err| ClusterError::ParseFailed(err.to_string())),
            Ok(Ok(output)) => Err(ClusterError::QueryFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ClusterError::KubectlNotFound)
            }
            Ok(Err(err)) => Err(ClusterError::Io(err)),
            Err(_) => Err(ClusterError::Timeout),
        }
    }

    /// Generate the shadow SSH keypair if it does not exist yet, returning
    /// (private key path, public key material). Safe to call repeatedly
    /// for the same name.
    async fn ensure_key_pair(&self, name: &str) -> Result<(PathBuf, String), ClusterError> {
        fs::create_dir_all(&self.key_dir).await?;
        let private_key = self.key_dir.join(name);
        let public_key = self.key_dir.join(format!("{name}.pub"));

        if !private_key.exists() {
            let output = Command::new("ssh-keygen")
                .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
                .arg(&private_key)
                .output()
                .await?;
            if !output.status.success() {
                return Err(ClusterError::ProvisionFailed(format!(
                    "ssh-keygen failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            debug!("Generated shadow key pair at {}", private_key.display());
        }

        let public_material = fs::read_to_string(&public_key).await?;
        Ok((private_key, public_material.trim().to_string()))
    }

    /// Poll until the shadow pod is Running with an address.
    async fn wait_for_shadow_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, ClusterError> {
        let selector = format!("{LABEL_NAME}={name}");
        let deadline = Instant::now() + SHADOW_READY_TIMEOUT;

        loop {
            let output = self
                .kubectl(&["get", "pods", "-n", namespace, "-l", &selector, "-o", "json"])
                .await?;
            let pods: ObjectList<Pod> = serde_json::from_str(&output)
                .map_err(|err| ClusterError::ParseFailed(err.to_string()))?;

            if let Some(address) = ready_pod_address(&pods.items) {
                return Ok(address);
            }

            if Instant::now() >= deadline {
                return Err(ClusterError::ProvisionFailed(format!(
                    "shadow pod {name} did not become ready within {}s",
                    SHADOW_READY_TIMEOUT.as_secs()
                )));
            }
            sleep(SHADOW_POLL_INTERVAL).await;
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn get_or_create_shadow(
        &self,
        name: &str,
        spec: &ShadowSpec,
    ) -> Result<ShadowEndpoint, ClusterError> {
        let (private_key, public_material) = self.ensure_key_pair(name).await?;
        let config_ref = format!("{name}-ssh-key");

        // `kubectl apply` is create-or-update under the object name, so
        // concurrent shared-mode callers converge on one workload.
        self.kubectl_apply(&config_map_manifest(
            &config_ref,
            spec,
            name,
            &public_material,
        ))
        .await
        .map_err(provision_error)?;

        self.kubectl_apply(&deployment_manifest(name, spec, &config_ref))
            .await
            .map_err(provision_error)?;

        info!("Waiting for shadow workload {name} in {}", spec.namespace);
        let endpoint_address = self.wait_for_shadow_pod(&spec.namespace, name).await?;

        Ok(ShadowEndpoint {
            workload_name: name.to_string(),
            endpoint_address,
            credential: SshCredential {
                username: SHADOW_SSH_USER.to_string(),
                private_key_path: private_key,
            },
            config_ref,
        })
    }

    async fn cluster_cidrs(&self, namespace: &str) -> Result<Vec<String>, ClusterError> {
        let output = self.kubectl(&["get", "nodes", "-o", "json"]).await?;
        let nodes: ObjectList<Node> = serde_json::from_str(&output)
            .map_err(|err| ClusterError::ParseFailed(err.to_string()))?;

        let mut cidrs = Vec::new();
        for node in &nodes.items {
            for cidr in &node.spec.pod_cidrs {
                push_unique(&mut cidrs, cidr.clone());
            }
            if node.spec.pod_cidrs.is_empty() {
                if let Some(cidr) = &node.spec.pod_cidr {
                    push_unique(&mut cidrs, cidr.clone());
                }
            }
        }

        // Clusters that do not expose node pod CIDRs: derive /24 blocks
        // from the pods actually present.
        if cidrs.is_empty() {
            let output = self
                .kubectl(&["get", "pods", "-n", namespace, "-o", "json"])
                .await?;
            let pods: ObjectList<Pod> = serde_json::from_str(&output)
                .map_err(|err| ClusterError::ParseFailed(err.to_string()))?;
            for pod in &pods.items {
                if let Some(ip) = &pod.status.pod_ip {
                    if let Some(cidr) = pod_cidr_of(ip) {
                        push_unique(&mut cidrs, cidr);
                    }
                }
            }
        }

        let output = self
            .kubectl(&["get", "services", "-n", namespace, "-o", "json"])
            .await?;
        let services: ObjectList<Service> = serde_json::from_str(&output)
            .map_err(|err| ClusterError::ParseFailed(err.to_string()))?;
        for service in &services.items {
            if let Some(ip) = &service.spec.cluster_ip {
                if let Some(cidr) = service_cidr_of(ip) {
                    push_unique(&mut cidrs, cidr);
                }
            }
        }

        Ok(cidrs)
    }

    async fn service_hosts(
        &self,
        namespace: &str,
    ) -> Result<HashMap<String, String>, ClusterError> {
        let output = self
            .kubectl(&["get", "services", "-n", namespace, "-o", "json"])
            .await?;
        let services: ObjectList<Service> = serde_json::from_str(&output)
            .map_err(|err| ClusterError::ParseFailed(err.to_string()))?;

        Ok(services
            .items
            .into_iter()
            .map(|service| {
                let address = service.spec.cluster_ip.unwrap_or_default();
                (service.metadata.name, address)
            })
            .collect())
    }

    async fn remove_shadow(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.kubectl(&[
            "delete",
            "deployment",
            name,
            "-n",
            namespace,
            "--ignore-not-found",
        ])
        .await?;
        Ok(())
    }

    async fn remove_config(&self, namespace: &str, config_ref: &str) -> Result<(), ClusterError> {
        self.kubectl(&[
            "delete",
            "configmap",
            config_ref,
            "-n",
            namespace,
            "--ignore-not-found",
        ])
        .await?;
        Ok(())
    }
}

/// Address of the first pod that is Running with an assigned address.
/// Pending pods and Running pods still waiting for an address do not
/// count as ready.
fn ready_pod_address(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .find(|pod| pod.status.phase.as_deref() == Some("Running") && pod.status.pod_ip.is_some())
        .and_then(|pod| pod.status.pod_ip.clone())
}

fn provision_error(err: ClusterError) -> ClusterError {
    match err {
        ClusterError::QueryFailed(message) => ClusterError::ProvisionFailed(message),
        other => other,
    }
}

fn push_unique(cidrs: &mut Vec<String>, cidr: String) {
    if !cidrs.contains(&cidr) {
        cidrs.push(cidr);
    }
}

/// /24 block containing a pod address.
fn pod_cidr_of(ip: &str) -> Option<String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    Some(format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]))
}

/// /16 block containing a service cluster address.
fn service_cidr_of(ip: &str) -> Option<String> {
    if ip.is_empty() || ip == "None" {
        return None;
    }
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    Some(format!("{}.{}.0.0/16", octets[0], octets[1]))
}

fn config_map_manifest(
    config_ref: &str,
    spec: &ShadowSpec,
    name: &str,
    public_material: &str,
) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": config_ref,
            "namespace": spec.namespace,
            "labels": labels_with_name(spec, name),
        },
        "data": {
            "authorized_key": public_material,
        },
    })
}

fn deployment_manifest(name: &str, spec: &ShadowSpec, config_ref: &str) -> serde_json::Value {
    let env: Vec<serde_json::Value> = spec
        .envs
        .iter()
        .map(|(key, value)| json!({ "name": key, "value": value }))
        .collect();

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": labels_with_name(spec, name),
            "annotations": spec.annotations,
        },
        "spec": {
            "replicas": 1,
            "selector": {
                "matchLabels": { "kubetun-name": name },
            },
            "template": {
                "metadata": {
                    "labels": labels_with_name(spec, name),
                    "annotations": spec.annotations,
                },
                "spec": {
                    "containers": [{
                        "name": "shadow",
                        "image": spec.image,
                        "env": env,
                        "ports": [{ "containerPort": 22 }],
                        // The shadow sshd trusts exactly the key generated
                        // for this workload.
                        "volumeMounts": [{
                            "name": "ssh-authorized-key",
                            "mountPath": "/root/.ssh",
                        }],
                    }],
                    "volumes": [{
                        "name": "ssh-authorized-key",
                        "configMap": {
                            "name": config_ref,
                            "items": [{
                                "key": "authorized_key",
                                "path": "authorized_keys",
                            }],
                        },
                    }],
                },
            },
        },
    })
}

fn labels_with_name(spec: &ShadowSpec, name: &str) -> HashMap<String, String> {
    let mut labels = spec.labels.clone();
    labels
        .entry(LABEL_NAME.to_string())
        .or_insert_with(|| name.to_string());
    labels
}
