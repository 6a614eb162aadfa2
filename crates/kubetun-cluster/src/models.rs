//! Shadow workload data model
//!
//! Label and environment variable names match what the shadow image and
//! the cleanup label selectors expect, so they are fixed constants here.

use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Ownership marker present on every kubetun-managed resource.
pub const LABEL_CONTROL_BY: &str = "control-by";
pub const CONTROL_BY_VALUE: &str = "kubetun";

/// Which kubetun command created the resource.
pub const LABEL_COMPONENT: &str = "kubetun-component";
pub const COMPONENT_CONNECT: &str = "connect";

/// Resolved workload name, also used as the lookup selector.
pub const LABEL_NAME: &str = "kubetun-name";

/// Version tag of the workload (generated suffix, or "shared").
pub const LABEL_VERSION: &str = "kubetun-version";

/// Environment variables injected into the shadow container.
pub const ENV_LOCAL_DOMAIN: &str = "KUBETUN_LOCAL_DOMAIN";
pub const ENV_CLIENT_TUN_IP: &str = "KUBETUN_CLIENT_TUN_IP";
pub const ENV_SERVER_TUN_IP: &str = "KUBETUN_SERVER_TUN_IP";

const SHADOW_NAME_PREFIX: &str = "kubetun-shadow";
const SHARED_TAG: &str = "shared";

/// How a shadow workload name was derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameSuffix {
    /// Deterministic name shared by concurrent connect invocations
    Shared,
    /// Random per-process suffix
    Generated(String),
}

/// Structured identity of a shadow workload.
///
/// The version tag travels with the identity instead of being re-parsed
/// out of the name's last hyphen-delimited segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadId {
    name: String,
    suffix: NameSuffix,
}

impl WorkloadId {
    /// Identity with a fresh random 5-character suffix. Collisions are
    /// statistically negligible and not tracked.
    pub fn generated() -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string()[..5].to_string();
        Self {
            name: format!("{SHADOW_NAME_PREFIX}-{suffix}"),
            suffix: NameSuffix::Generated(suffix),
        }
    }

    /// The deterministic shared identity: every shared-mode invocation
    /// converges on this name.
    pub fn shared() -> Self {
        Self {
            name: format!("{SHADOW_NAME_PREFIX}-{SHARED_TAG}"),
            suffix: NameSuffix::Shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version_tag(&self) -> &str {
        match &self.suffix {
            NameSuffix::Shared => SHARED_TAG,
            NameSuffix::Generated(suffix) => suffix,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.suffix == NameSuffix::Shared
    }
}

/// Opaque SSH material the transport uses to authenticate to the shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredential {
    pub username: String,
    pub private_key_path: PathBuf,
}

/// Result of shadow provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEndpoint {
    pub workload_name: String,
    /// Address of the tunnel endpoint, reachable from inside the cluster
    pub endpoint_address: String,
    pub credential: SshCredential,
    /// Name of the remote config artifact holding the shadow's SSH key
    pub config_ref: String,
}

/// Inputs for creating or looking up a shadow workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowSpec {
    pub namespace: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub envs: HashMap<String, String>,
}
