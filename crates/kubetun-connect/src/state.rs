//! Runtime state and workspace cleanup
//!
//! Everything the connect flow mutates outside its own process (lock file,
//! proxy settings, hosts file, remote shadow) is recorded here, and the
//! single cleanup routine reverts exactly what was touched. Teardown
//! failures are logged and skipped over: cleanup must never prevent the
//! process from exiting.

use std::net::Ipv4Addr;

use kubetun_cluster::ClusterClient;
use kubetun_net::{proxy, HostsFile, ProxyConfig};
use tracing::{info, warn};

use crate::lock::PidLock;

/// Local record of the provisioned shadow workload.
#[derive(Debug, Clone)]
pub struct ShadowLease {
    pub namespace: String,
    pub workload_name: String,
    pub config_ref: String,
    /// Shared shadows outlive this process and are never deleted here
    pub shared: bool,
}

/// Mutable process-lifetime state owned by the orchestrator.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub lock: Option<PidLock>,
    pub shadow: Option<ShadowLease>,
    pub proxy: ProxyConfig,
    pub host_dump_active: bool,
    /// Allocated (source, destination) pair, TUN mode only
    pub tun_pair: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl RuntimeState {
    /// Revert everything this process set up, in reverse setup order.
    pub async fn cleanup(&mut self, cluster: &dyn ClusterClient, hosts: &HostsFile) {
        info!("Cleaning up workspace");

        if self.host_dump_active {
            if let Err(err) = hosts.revert() {
                warn!("Failed to revert hosts file: {err}");
            }
            self.host_dump_active = false;
        }

        proxy::reset_proxy(&mut self.proxy).await;

        if let Some(lease) = self.shadow.take() {
            if lease.shared {
                info!(
                    "Leaving shared shadow {} running for other clients",
                    lease.workload_name
                );
            } else {
                if let Err(err) = cluster
                    .remove_shadow(&lease.namespace, &lease.workload_name)
                    .await
                {
                    warn!("Failed to remove shadow {}: {err}", lease.workload_name);
                }
                if let Err(err) = cluster
                    .remove_config(&lease.namespace, &lease.config_ref)
                    .await
                {
                    warn!("Failed to remove shadow config {}: {err}", lease.config_ref);
                }
            }
        }

        if let Some(lock) = self.lock.take() {
            if let Err(err) = lock.release() {
                warn!("Failed to remove pid file: {err}");
            }
        }
    }
}
