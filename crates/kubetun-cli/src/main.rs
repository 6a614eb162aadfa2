//! kubetun CLI - tunnel a local workstation into a Kubernetes cluster

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubetun_cluster::KubectlClient;
use kubetun_connect::{parse_labels, ConnectConfig, Connector};
use kubetun_transport::{SshExecTransport, TransportMode};

/// kubetun - reach cluster-internal services from your workstation
#[derive(Parser, Debug)]
#[command(name = "kubetun")]
#[command(about = "Tunnel a local workstation into a Kubernetes cluster", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Establish a tunnel to the cluster and keep it up until interrupted
    Connect {
        /// Transport mode (ssh, socks, tun)
        #[arg(long, default_value = "ssh")]
        mode: String,

        /// Cluster namespace the shadow workload lives in
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,

        /// CIDR the TUN address pair is allocated from (tun mode)
        #[arg(long, default_value = "10.1.1.0/30")]
        tun_cidr: String,

        /// Local SOCKS5 port (socks mode)
        #[arg(long, default_value = "2223")]
        socks_port: u16,

        /// Reuse one shared shadow workload across connect invocations
        #[arg(long)]
        share_shadow: bool,

        /// Namespaces whose service addresses are written to the hosts file
        #[arg(long = "dump2hosts", value_delimiter = ',')]
        dump_namespaces: Vec<String>,

        /// Domain suffix handed to the shadow for local resolution
        #[arg(long)]
        local_domain: Option<String>,

        /// Extra labels for the shadow workload (key=value, comma separated)
        #[arg(long)]
        labels: Option<String>,

        /// Image the shadow workload runs
        #[arg(long, env = "KUBETUN_SHADOW_IMAGE", default_value = "kubetun/shadow:latest")]
        image: String,

        /// Working directory for the pid file and key material
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Connect {
            mode,
            namespace,
            tun_cidr,
            socks_port,
            share_shadow,
            dump_namespaces,
            local_domain,
            labels,
            image,
            work_dir,
        } => {
            let mode: TransportMode = mode
                .parse()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .context("Invalid --mode")?;

            let config = ConnectConfig {
                mode,
                socks_port,
                tun_cidr,
                share_shadow,
                dump_namespaces,
                local_domain,
                labels: labels
                    .as_deref()
                    .map(parse_labels)
                    .unwrap_or_else(HashMap::new),
                namespace,
                shadow_image: image,
                work_dir: work_dir.unwrap_or_else(default_work_dir),
                hosts_path: None,
            };

            let cluster = Arc::new(
                KubectlClient::discover(config.key_dir()).context("Failed to locate kubectl")?,
            );
            let transport = Arc::new(SshExecTransport::new(config.mode, config.socks_port));

            info!("Connecting to namespace {} in {} mode", config.namespace, config.mode);
            Connector::new(config, cluster, transport)
                .connect()
                .await
                .context("Connect failed")?;
            Ok(())
        }
    }
}

fn default_work_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".kubetun"))
        .unwrap_or_else(|| std::env::temp_dir().join("kubetun"))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
