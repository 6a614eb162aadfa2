//! Connect orchestration tests
//!
//! Drive the orchestrator against in-memory cluster and transport doubles
//! and assert on the state it leaves behind: lock file, hosts file, shadow
//! lease, and the route handed to the transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use kubetun_cluster::{
    ClusterClient, ClusterError, ShadowEndpoint, ShadowSpec, SshCredential,
};
use kubetun_connect::{
    ConnectConfig, ConnectError, Connector, LifecycleMonitor, LockError, RuntimeState, ShadowLease,
};
use kubetun_net::IpAllocError;
use kubetun_transport::{
    ProcessWatch, TransportError, TransportMode, TunnelRoute, TunnelTransport,
};

#[derive(Default)]
struct FakeCluster {
    /// Service tables per namespace
    hosts: HashMap<String, HashMap<String, String>>,
    cidrs: Vec<String>,
    live_workloads: Mutex<Vec<String>>,
    live_configs: Mutex<Vec<String>>,
    fail_provision: bool,
    /// Simulate a provision that never becomes ready
    hang_provision: bool,
    fail_hosts: bool,
}

impl FakeCluster {
    fn with_hosts(hosts: &[(&str, &[(&str, &str)])]) -> Self {
        let mut tables = HashMap::new();
        for (namespace, entries) in hosts {
            let table = entries
                .iter()
                .map(|(name, address)| (name.to_string(), address.to_string()))
                .collect();
            tables.insert(namespace.to_string(), table);
        }
        Self {
            hosts: tables,
            cidrs: vec!["10.244.0.0/16".to_string()],
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_or_create_shadow(
        &self,
        name: &str,
        _spec: &ShadowSpec,
    ) -> Result<ShadowEndpoint, ClusterError> {
        if self.fail_provision {
            return Err(ClusterError::ProvisionFailed("quota exceeded".to_string()));
        }
        if self.hang_provision {
            std::future::pending::<()>().await;
        }
        let mut live = self.live_workloads.lock().unwrap();
        if !live.iter().any(|existing| existing == name) {
            live.push(name.to_string());
        }
        let config_ref = format!("{name}-ssh-key");
        self.live_configs.lock().unwrap().push(config_ref.clone());
        Ok(ShadowEndpoint {
            workload_name: name.to_string(),
            endpoint_address: "10.244.1.7".to_string(),
            credential: SshCredential {
                username: "root".to_string(),
                private_key_path: "/tmp/key".into(),
            },
            config_ref,
        })
    }

    async fn cluster_cidrs(&self, _namespace: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self.cidrs.clone())
    }

    async fn service_hosts(
        &self,
        namespace: &str,
    ) -> Result<HashMap<String, String>, ClusterError> {
        if self.fail_hosts {
            return Err(ClusterError::QueryFailed("services unavailable".to_string()));
        }
        Ok(self.hosts.get(namespace).cloned().unwrap_or_default())
    }

    async fn remove_shadow(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.live_workloads
            .lock()
            .unwrap()
            .retain(|existing| existing != name);
        Ok(())
    }

    async fn remove_config(&self, _namespace: &str, config_ref: &str) -> Result<(), ClusterError> {
        self.live_configs
            .lock()
            .unwrap()
            .retain(|existing| existing != config_ref);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTransport {
    routes: Mutex<Vec<TunnelRoute>>,
    fail: bool,
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn outbound(
        &self,
        route: &TunnelRoute,
        _credential: &SshCredential,
        _watch: ProcessWatch,
    ) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::SpawnFailed("ssh: not found".to_string()));
        }
        self.routes.lock().unwrap().push(route.clone());
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> ConnectConfig {
    ConnectConfig {
        namespace: "ns1".to_string(),
        work_dir: dir.path().join("workspace"),
        hosts_path: Some(dir.path().join("hosts")),
        ..Default::default()
    }
}

fn watch() -> ProcessWatch {
    let (_monitor, watch) = LifecycleMonitor::new();
    watch
}

#[tokio::test]
async fn test_tun_mode_allocates_and_routes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.mode = TransportMode::Tun;
    config.tun_cidr = "10.1.1.0/30".to_string();

    let cluster = Arc::new(FakeCluster::with_hosts(&[]));
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let connector = Connector::new(config, cluster.clone(), transport.clone());

    let mut state = RuntimeState::default();
    connector.establish(&mut state, &hosts, watch()).await.unwrap();

    let (source, destination) = state.tun_pair.unwrap();
    assert_ne!(source, destination);

    let routes = transport.routes.lock().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].tun_pair, Some((source, destination)));
    assert_eq!(routes[0].cidrs, vec!["10.244.0.0/16".to_string()]);
    assert_eq!(routes[0].endpoint_address, "10.244.1.7");

    let lease = state.shadow.as_ref().unwrap();
    assert!(!lease.shared);
    assert!(lease.workload_name.starts_with("kubetun-shadow-"));
}

#[tokio::test]
async fn test_invalid_tun_cidr_is_fatal_before_any_state() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.mode = TransportMode::Tun;
    config.tun_cidr = "not-a-cidr".to_string();

    let cluster = Arc::new(FakeCluster::with_hosts(&[]));
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let connector = Connector::new(config, cluster.clone(), transport.clone());

    let mut state = RuntimeState::default();
    let err = connector
        .establish(&mut state, &hosts, watch())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConnectError::Allocation(IpAllocError::InvalidCidr(_))
    ));
    assert!(cluster.live_workloads.lock().unwrap().is_empty());
    assert!(transport.routes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_hosts_dump_merges_and_qualifies() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dump_namespaces = vec!["ns1".to_string(), "ns2".to_string()];

    let cluster = Arc::new(FakeCluster::with_hosts(&[
        ("ns1", &[("svcA", "1.1.1.1")]),
        ("ns2", &[("svcA", "2.2.2.2"), ("svcB", "")]),
    ]));
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let hosts_path = dir.path().join("hosts");
    let connector = Connector::new(config, cluster, transport);

    let mut state = RuntimeState::default();
    connector.establish(&mut state, &hosts, watch()).await.unwrap();

    assert!(state.host_dump_active);
    let content = std::fs::read_to_string(&hosts_path).unwrap();
    assert!(content.contains("1.1.1.1\tsvcA"));
    assert!(content.contains("2.2.2.2\tsvcA.ns2"));
    assert!(!content.contains("svcB"));
}

#[tokio::test]
async fn test_hosts_dump_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dump_namespaces = vec!["ns2".to_string()];

    let mut cluster = FakeCluster::with_hosts(&[]);
    cluster.fail_hosts = true;
    let cluster = Arc::new(cluster);
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let connector = Connector::new(config, cluster, transport.clone());

    let mut state = RuntimeState::default();
    connector.establish(&mut state, &hosts, watch()).await.unwrap();

    assert!(!state.host_dump_active);
    // The tunnel itself still came up
    assert_eq!(transport.routes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_provision_failure_stops_the_flow() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let mut cluster = FakeCluster::with_hosts(&[]);
    cluster.fail_provision = true;
    let cluster = Arc::new(cluster);
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let connector = Connector::new(config, cluster, transport.clone());

    let mut state = RuntimeState::default();
    let err = connector
        .establish(&mut state, &hosts, watch())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConnectError::Cluster(ClusterError::ProvisionFailed(_))
    ));
    assert!(transport.routes.lock().unwrap().is_empty());
    assert!(state.shadow.is_none());
}

#[tokio::test]
async fn test_cleanup_removes_exclusive_shadow() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let cluster = Arc::new(FakeCluster::with_hosts(&[("ns1", &[("svcA", "1.1.1.1")])]));
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let connector = Connector::new(config, cluster.clone(), transport);

    let mut state = RuntimeState::default();
    connector.establish(&mut state, &hosts, watch()).await.unwrap();
    assert_eq!(cluster.live_workloads.lock().unwrap().len(), 1);

    state.cleanup(cluster.as_ref(), &hosts).await;
    assert!(cluster.live_workloads.lock().unwrap().is_empty());
    assert!(cluster.live_configs.lock().unwrap().is_empty());
    assert!(state.shadow.is_none());
}

#[tokio::test]
async fn test_cleanup_never_deletes_shared_shadow() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(FakeCluster::with_hosts(&[]));
    let hosts = kubetun_net::HostsFile::new(dir.path().join("hosts"));

    let mut state = RuntimeState {
        shadow: Some(ShadowLease {
            namespace: "ns1".to_string(),
            workload_name: "kubetun-shadow-shared".to_string(),
            config_ref: "kubetun-shadow-shared-ssh-key".to_string(),
            shared: true,
        }),
        ..Default::default()
    };
    cluster
        .live_workloads
        .lock()
        .unwrap()
        .push("kubetun-shadow-shared".to_string());

    state.cleanup(cluster.as_ref(), &hosts).await;
    assert_eq!(
        *cluster.live_workloads.lock().unwrap(),
        vec!["kubetun-shadow-shared".to_string()]
    );
}

#[tokio::test]
async fn test_interrupt_during_setup_leaves_state_cleanable() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dump_namespaces = vec!["ns1".to_string()];

    let mut cluster = FakeCluster::with_hosts(&[("ns1", &[("svcA", "1.1.1.1")])]);
    cluster.hang_provision = true;
    let cluster = Arc::new(cluster);
    let transport = Arc::new(FakeTransport::default());
    let hosts = config.hosts_file();
    let hosts_path = dir.path().join("hosts");
    let connector = Connector::new(config, cluster.clone(), transport.clone());

    // The provision step never completes; the interrupt must win the race
    // with the hosts dump already applied.
    let mut state = RuntimeState::default();
    let outcome = connector
        .establish_until(&mut state, &hosts, watch(), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        })
        .await;

    assert!(outcome.is_none());
    assert!(state.host_dump_active);
    assert!(std::fs::read_to_string(&hosts_path).unwrap().contains("svcA"));
    assert!(transport.routes.lock().unwrap().is_empty());

    state.cleanup(cluster.as_ref(), &hosts).await;
    assert!(!std::fs::read_to_string(&hosts_path).unwrap().contains("svcA"));
    assert!(!state.host_dump_active);
}

#[tokio::test]
async fn test_connect_cleans_up_after_transport_failure() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let pid_file = config.pid_file();

    let cluster = Arc::new(FakeCluster::with_hosts(&[]));
    let transport = Arc::new(FakeTransport {
        fail: true,
        ..Default::default()
    });
    let connector = Connector::new(config, cluster.clone(), transport);

    let err = connector.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)));

    // Cleanup ran: the exclusive shadow and the lock file are gone
    assert!(cluster.live_workloads.lock().unwrap().is_empty());
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn test_connect_fails_fast_when_lock_is_held() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let pid_file = config.pid_file();
    std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    std::fs::write(&pid_file, std::process::id().to_string()).unwrap();

    let cluster = Arc::new(FakeCluster::with_hosts(&[]));
    let transport = Arc::new(FakeTransport::default());
    let connector = Connector::new(config, cluster.clone(), transport);

    let err = connector.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Lock(LockError::AlreadyRunning { .. })
    ));
    // The losing process must not have touched anything
    assert!(cluster.live_workloads.lock().unwrap().is_empty());
    assert!(pid_file.exists());
}
