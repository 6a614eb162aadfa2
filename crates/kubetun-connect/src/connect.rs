//! Connect orchestration
//!
//! Drives the setup steps strictly in order: exclusivity lock, TUN
//! allocation, hosts dump, proxy registration, shadow provisioning,
//! cluster CIDR query, transport hand-off, then blocks on the lifecycle
//! monitor. Hosts dump and proxy registration degrade gracefully; a
//! reachable tunnel beats a fully decorated local environment. Everything
//! else is fatal and aborts with the partial state reverted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use kubetun_cluster::models::{ENV_CLIENT_TUN_IP, ENV_LOCAL_DOMAIN, ENV_SERVER_TUN_IP};
use kubetun_cluster::{get_or_create_shadow, ClusterClient, ClusterError, ProvisionRequest};
use kubetun_net::{allocate_tun_pair, merge_host_tables, proxy, HostsFile, IpAllocError};
use kubetun_transport::{
    ProcessWatch, TransportError, TransportMode, TunnelRoute, TunnelTransport,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ConnectConfig;
use crate::lifecycle::{CleanupLatch, InterruptEvent, LifecycleMonitor};
use crate::lock::{LockError, PidLock};
use crate::state::{RuntimeState, ShadowLease};

/// Fatal connect errors, by setup step.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Allocation(#[from] IpAllocError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level connect state machine.
pub struct Connector {
    config: ConnectConfig,
    cluster: Arc<dyn ClusterClient>,
    transport: Arc<dyn TunnelTransport>,
}

impl Connector {
    pub fn new(
        config: ConnectConfig,
        cluster: Arc<dyn ClusterClient>,
        transport: Arc<dyn TunnelTransport>,
    ) -> Self {
        Self {
            config,
            cluster,
            transport,
        }
    }

    /// Run the full connect lifecycle. Returns after an explicit
    /// termination signal; on a background failure the process exits from
    /// inside this call once cleanup has completed.
    pub async fn connect(self) -> Result<(), ConnectError> {
        let lock = PidLock::acquire(self.config.pid_file())?;
        info!("Connect start at {}", std::process::id());

        let mut state = RuntimeState {
            lock: Some(lock),
            ..Default::default()
        };
        let hosts = self.config.hosts_file();
        let (monitor, watch) = LifecycleMonitor::new();
        let latch = CleanupLatch::new();

        // A termination signal arriving mid-setup (for example during the
        // shadow readiness poll) must still revert whatever the finished
        // steps already changed.
        let setup = self
            .establish_until(&mut state, &hosts, watch, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        match setup {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                if latch.begin() {
                    state.cleanup(self.cluster.as_ref(), &hosts).await;
                }
                return Err(err);
            }
            None => {
                info!("Terminal signal is {}", InterruptEvent::UserTerminate);
                if latch.begin() {
                    state.cleanup(self.cluster.as_ref(), &hosts).await;
                }
                return Ok(());
            }
        }

        let event = monitor.wait().await;
        info!("Terminal signal is {event}");
        if latch.begin() {
            state.cleanup(self.cluster.as_ref(), &hosts).await;
        }

        match event {
            InterruptEvent::UserTerminate => Ok(()),
            // The tunnel died under us; nothing is left to return to, so
            // take the whole process down after cleanup.
            InterruptEvent::BackgroundFailure(_) => std::process::exit(0),
        }
    }

    /// Race the setup steps against an interrupt source. Returns `None`
    /// when the interrupt fires first; `state` keeps whatever the finished
    /// steps recorded so the caller can clean up.
    pub async fn establish_until<F>(
        &self,
        state: &mut RuntimeState,
        hosts: &HostsFile,
        watch: ProcessWatch,
        interrupt: F,
    ) -> Option<Result<(), ConnectError>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.establish(state, hosts, watch) => Some(result),
            _ = interrupt => None,
        }
    }

    /// Setup steps after the lock: strictly ordered, each step starting
    /// only after the previous one finished.
    pub async fn establish(
        &self,
        state: &mut RuntimeState,
        hosts: &HostsFile,
        watch: ProcessWatch,
    ) -> Result<(), ConnectError> {
        if self.config.mode == TransportMode::Tun {
            let (source, destination) = allocate_tun_pair(&self.config.tun_cidr)?;
            info!("Allocated TUN addresses {source} -> {destination}");
            state.tun_pair = Some((source, destination));
        }

        // Windows has no nsswitch-style resolution hook, so the hosts dump
        // always runs there; elsewhere it is opt-in via dump namespaces.
        if cfg!(windows) || !self.config.dump_namespaces.is_empty() {
            if let Err(err) = self.dump_to_hosts(state, hosts).await {
                warn!("Failed to dump service hosts, continuing without: {err}");
            }
        }

        if self.config.mode == TransportMode::Socks {
            if let Err(err) = proxy::set_global_proxy(self.config.socks_port, &mut state.proxy).await
            {
                warn!("Failed to setup global proxy: {err}");
            }
            if let Err(err) = proxy::set_env_proxy(self.config.socks_port, &mut state.proxy) {
                warn!("Failed to setup proxy environment: {err}");
            }
        }

        let request = ProvisionRequest {
            namespace: self.config.namespace.clone(),
            share_shadow: self.config.share_shadow,
            image: self.config.shadow_image.clone(),
            user_labels: self.config.labels.clone(),
            annotations: HashMap::new(),
            envs: self.shadow_envs(state),
        };
        let (id, endpoint) = get_or_create_shadow(self.cluster.as_ref(), &request).await?;
        state.shadow = Some(ShadowLease {
            namespace: self.config.namespace.clone(),
            workload_name: id.name().to_string(),
            config_ref: endpoint.config_ref.clone(),
            shared: id.is_shared(),
        });

        let cidrs = self.cluster.cluster_cidrs(&self.config.namespace).await?;
        debug!("Cluster CIDRs: {cidrs:?}");

        let route = TunnelRoute {
            pod_name: endpoint.workload_name.clone(),
            endpoint_address: endpoint.endpoint_address.clone(),
            cidrs,
            tun_pair: state.tun_pair,
        };
        self.transport
            .outbound(&route, &endpoint.credential, watch)
            .await?;

        Ok(())
    }

    /// Collect service tables and persist them into the hosts override.
    /// Failures here degrade the run, never abort it.
    async fn dump_to_hosts(
        &self,
        state: &mut RuntimeState,
        hosts: &HostsFile,
    ) -> Result<(), ConnectError> {
        let primary = self.cluster.service_hosts(&self.config.namespace).await?;
        for (service, address) in &primary {
            info!("Service found: {service} {address}");
        }

        let mut extras = Vec::new();
        for namespace in &self.config.dump_namespaces {
            if namespace == &self.config.namespace {
                continue;
            }
            debug!("Searching services in namespace {namespace}");
            let table = self.cluster.service_hosts(namespace).await?;
            for (service, address) in &table {
                info!("Service found: {service}.{namespace} {address}");
            }
            extras.push((namespace.clone(), table));
        }

        let table = merge_host_tables(&self.config.namespace, primary, extras);
        hosts.dump(&table)?;
        state.host_dump_active = true;
        Ok(())
    }

    /// Environment injected into the shadow container for downstream
    /// tooling discovery.
    fn shadow_envs(&self, state: &RuntimeState) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        if let Some(domain) = &self.config.local_domain {
            envs.insert(ENV_LOCAL_DOMAIN.to_string(), domain.clone());
        }
        if let Some((source, destination)) = state.tun_pair {
            envs.insert(ENV_CLIENT_TUN_IP.to_string(), source.to_string());
            envs.insert(ENV_SERVER_TUN_IP.to_string(), destination.to_string());
        }
        envs
    }
}
