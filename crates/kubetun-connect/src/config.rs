//! Per-invocation connect configuration
//!
//! Built once at startup from the CLI surface and never mutated after.

use std::collections::HashMap;
use std::path::PathBuf;

use kubetun_net::HostsFile;
use kubetun_transport::TransportMode;

/// Immutable configuration for one connect invocation.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub mode: TransportMode,
    /// Local SOCKS5 port, SOCKS mode only
    pub socks_port: u16,
    /// CIDR to draw the TUN address pair from, TUN mode only
    pub tun_cidr: String,
    /// Reuse the deterministic shared shadow workload
    pub share_shadow: bool,
    /// Extra namespaces to dump service hosts from, in order
    pub dump_namespaces: Vec<String>,
    pub local_domain: Option<String>,
    /// User labels merged onto the shadow workload
    pub labels: HashMap<String, String>,
    /// Primary cluster namespace
    pub namespace: String,
    /// Image the shadow workload runs
    pub shadow_image: String,
    /// Directory for the pid file and generated key material
    pub work_dir: PathBuf,
    /// Hosts file override; None means the system hosts file
    pub hosts_path: Option<PathBuf>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            socks_port: 2223,
            tun_cidr: "10.1.1.0/30".to_string(),
            share_shadow: false,
            dump_namespaces: Vec::new(),
            local_domain: None,
            labels: HashMap::new(),
            namespace: "default".to_string(),
            shadow_image: "kubetun/shadow:latest".to_string(),
            work_dir: std::env::temp_dir().join("kubetun"),
            hosts_path: None,
        }
    }
}

impl ConnectConfig {
    /// Exclusivity lock location for this workspace.
    pub fn pid_file(&self) -> PathBuf {
        self.work_dir.join("connect.pid")
    }

    /// Where generated shadow SSH keys live.
    pub fn key_dir(&self) -> PathBuf {
        self.work_dir.join("keys")
    }

    pub fn hosts_file(&self) -> HostsFile {
        match &self.hosts_path {
            Some(path) => HostsFile::new(path),
            None => HostsFile::system(),
        }
    }
}

/// Parse a `key=value,key2=value2` label string. Segments without `=` are
/// skipped.
pub fn parse_labels(spec: &str) -> HashMap<String, String> {
    spec.split(',')
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
