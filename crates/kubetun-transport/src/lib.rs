//! Tunnel transport collaborator
//!
//! The orchestrator hands the shadow endpoint to a [`TunnelTransport`] and
//! never touches the tunneled bytes itself. The bundled implementation
//! shells out to ssh/sshuttle; anything that keeps the tunnel alive and
//! reports its death on the watch channel satisfies the seam.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubetun_cluster::SshCredential;

/// How traffic crosses the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Forward cluster ranges over an SSH session (default)
    #[default]
    SshForward,
    /// Local SOCKS5 proxy backed by the SSH session
    Socks,
    /// Virtual interface with an allocated address pair
    Tun,
}

impl FromStr for TransportMode {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Self::SshForward),
            "socks" => Ok(Self::Socks),
            "tun" => Ok(Self::Tun),
            other => Err(TransportError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SshForward => write!(f, "ssh"),
            Self::Socks => write!(f, "socks"),
            Self::Tun => write!(f, "tun"),
        }
    }
}

/// Transport collaborator errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown transport mode: {0} (expected ssh, socks or tun)")]
    UnknownMode(String),

    #[error("TUN mode requires an allocated address pair")]
    MissingTunAddresses,

    #[error("failed to spawn tunnel process: {0}")]
    SpawnFailed(String),

    #[error("tunnel setup command failed: {0}")]
    SetupFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification that a watched background process died unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundExit {
    pub reason: String,
}

/// Sender half handed to transports so they can report the death of their
/// background processes. Cloneable; the lifecycle monitor holds the
/// receiver.
#[derive(Debug, Clone)]
pub struct ProcessWatch {
    tx: mpsc::Sender<BackgroundExit>,
}

impl ProcessWatch {
    /// Create a watch channel. The receiver goes to the lifecycle monitor.
    pub fn channel() -> (Self, mpsc::Receiver<BackgroundExit>) {
        let (tx, rx) = mpsc::channel(4);
        (Self { tx }, rx)
    }

    /// Report an unexpected exit. A dropped receiver means the process is
    /// already shutting down, so send failures are ignored.
    pub async fn notify_exit(&self, reason: impl Into<String>) {
        let _ = self.tx.send(BackgroundExit { reason: reason.into() }).await;
    }
}

/// What the transport needs to reach the shadow endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRoute {
    pub pod_name: String,
    pub endpoint_address: String,
    /// Cluster CIDR blocks the tunnel must cover
    pub cidrs: Vec<String>,
    /// Allocated (local, remote) addresses, TUN mode only
    pub tun_pair: Option<(Ipv4Addr, Ipv4Addr)>,
}

/// Seam between the orchestrator and the actual tunnel session.
///
/// `outbound` starts the tunnel and returns once it is running; the
/// session then lives for the remainder of the process. Unexpected death
/// of the session is reported through the supplied watch.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn outbound(
        &self,
        route: &TunnelRoute,
        credential: &SshCredential,
        watch: ProcessWatch,
    ) -> Result<(), TransportError>;
}

/// Transport that execs ssh (and sshuttle in forward mode) against the
/// shadow endpoint.
pub struct SshExecTransport {
    mode: TransportMode,
    socks_port: u16,
}

impl SshExecTransport {
    pub fn new(mode: TransportMode, socks_port: u16) -> Self {
        Self { mode, socks_port }
    }

    /// Program and arguments of the long-running tunnel process.
    fn tunnel_command(
        &self,
        route: &TunnelRoute,
        credential: &SshCredential,
    ) -> Result<(String, Vec<String>), TransportError> {
        let key = credential.private_key_path.display().to_string();
        let target = format!("{}@{}", credential.username, route.endpoint_address);
        let ssh_options = [
            "-oStrictHostKeyChecking=no".to_string(),
            "-oUserKnownHostsFile=/dev/null".to_string(),
        ];

        match self.mode {
            TransportMode::SshForward => {
                // sshuttle routes the cluster CIDRs over the ssh session
                let mut args = vec![
                    "--dns".to_string(),
                    "-e".to_string(),
                    format!(
                        "ssh -i {key} {} {}",
                        ssh_options[0], ssh_options[1]
                    ),
                    "-r".to_string(),
                    target,
                ];
                args.extend(route.cidrs.iter().cloned());
                Ok(("sshuttle".to_string(), args))
            }
            TransportMode::Socks => {
                let mut args = ssh_options.to_vec();
                args.extend([
                    "-i".to_string(),
                    key,
                    "-D".to_string(),
                    self.socks_port.to_string(),
                    "-N".to_string(),
                    target,
                ]);
                Ok(("ssh".to_string(), args))
            }
            TransportMode::Tun => {
                let (source, destination) =
                    route.tun_pair.ok_or(TransportError::MissingTunAddresses)?;
                let mut args = ssh_options.to_vec();
                args.extend([
                    "-oTunnel=point-to-point".to_string(),
                    "-w".to_string(),
                    "0:0".to_string(),
                    "-i".to_string(),
                    key,
                    target,
                    format!("ip addr add {destination} peer {source} dev tun0 && ip link set tun0 up"),
                ]);
                Ok(("ssh".to_string(), args))
            }
        }
    }

    /// TUN mode: address the local interface and route the cluster CIDRs
    /// through it.
    async fn setup_local_tun(&self, route: &TunnelRoute) -> Result<(), TransportError> {
        let (source, destination) = route.tun_pair.ok_or(TransportError::MissingTunAddresses)?;

        run_setup("ip", &[
            "addr".to_string(),
            "add".to_string(),
            source.to_string(),
            "peer".to_string(),
            destination.to_string(),
            "dev".to_string(),
            "tun0".to_string(),
        ])
        .await?;
        run_setup("ip", &[
            "link".to_string(),
            "set".to_string(),
            "tun0".to_string(),
            "up".to_string(),
        ])
        .await?;
        for cidr in &route.cidrs {
            run_setup("ip", &[
                "route".to_string(),
                "add".to_string(),
                cidr.clone(),
                "dev".to_string(),
                "tun0".to_string(),
            ])
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelTransport for SshExecTransport {
    async fn outbound(
        &self,
        route: &TunnelRoute,
        credential: &SshCredential,
        watch: ProcessWatch,
    ) -> Result<(), TransportError> {
        let (program, args) = self.tunnel_command(route, credential)?;
        debug!("Starting tunnel: {program} {}", args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .spawn()
            .map_err(|err| TransportError::SpawnFailed(format!("{program}: {err}")))?;

        if self.mode == TransportMode::Tun {
            self.setup_local_tun(route).await?;
        }

        info!(
            "Tunnel to {} ({}) established in {} mode",
            route.pod_name, route.endpoint_address, self.mode
        );

        // The session is expected to outlive this call; its death is a
        // background failure.
        let pod_name = route.pod_name.clone();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => format!("tunnel process for {pod_name} exited: {status}"),
                Err(err) => format!("tunnel process for {pod_name} lost: {err}"),
            };
            warn!("{reason}");
            watch.notify_exit(reason).await;
        });

        Ok(())
    }
}

async fn run_setup(program: &str, args: &[String]) -> Result<(), TransportError> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(TransportError::SetupFailed(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
