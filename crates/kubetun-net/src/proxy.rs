//! SOCKS proxy registration
//!
//! In SOCKS transport mode local traffic reaches the cluster through a
//! SOCKS5 proxy on localhost. Registration happens at two levels: the
//! OS-wide proxy (so ordinary applications pick it up) and this process's
//! proxy environment variables (so child tooling picks it up). Both are
//! recorded in [`ProxyConfig`] so cleanup can revert exactly what was
//! touched.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variables pointed at the SOCKS proxy.
pub const PROXY_ENV_VARS: &[&str] = &["http_proxy", "https_proxy", "all_proxy"];

/// Proxy registration errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The platform proxy tool exited with a failure
    #[error("proxy tool failed: {0}")]
    CommandFailed(String),

    /// No OS-level proxy mechanism is available on this platform
    #[error("global proxy configuration is not supported on this platform")]
    Unsupported,

    /// I/O error while invoking the platform proxy tool
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record of the proxy state this process has applied.
///
/// Mutated only by the functions in this module; consulted during cleanup
/// to know what must be reverted.
#[derive(Debug, Default, Clone)]
pub struct ProxyConfig {
    global_port: Option<u16>,
    env_port: Option<u16>,
    /// Environment values as they were before the first `set_env_proxy`,
    /// keyed by variable name. `None` means the variable was unset.
    saved_env: HashMap<String, Option<String>>,
}

impl ProxyConfig {
    /// True if an OS-level proxy has been applied and not yet reverted.
    pub fn global_applied(&self) -> bool {
        self.global_port.is_some()
    }

    /// True if proxy environment variables have been applied and not yet
    /// reverted.
    pub fn env_applied(&self) -> bool {
        self.env_port.is_some()
    }
}

fn socks_url(port: u16) -> String {
    format!("socks5://127.0.0.1:{port}")
}

/// Point the OS-wide proxy at the local SOCKS port.
///
/// Idempotent: reapplying the same port is a no-op.
pub async fn set_global_proxy(port: u16, config: &mut ProxyConfig) -> Result<(), ProxyError> {
    if config.global_port == Some(port) {
        debug!("Global proxy already set to port {port}");
        return Ok(());
    }
    platform::enable_global_proxy(port).await?;
    config.global_port = Some(port);
    Ok(())
}

/// Point this process's proxy environment variables at the local SOCKS
/// port, saving the pre-existing values for revert.
///
/// Idempotent: reapplying the same port is a no-op, and saved values are
/// only captured the first time a variable is overwritten.
pub fn set_env_proxy(port: u16, config: &mut ProxyConfig) -> Result<(), ProxyError> {
    if config.env_port == Some(port) {
        debug!("Proxy environment already set to port {port}");
        return Ok(());
    }
    let url = socks_url(port);
    for var in PROXY_ENV_VARS {
        if !config.saved_env.contains_key(*var) {
            config
                .saved_env
                .insert(var.to_string(), std::env::var(var).ok());
        }
        std::env::set_var(var, &url);
    }
    config.env_port = Some(port);
    Ok(())
}

/// Revert everything recorded in `config`. Failures are logged, never
/// propagated: teardown must not stop on a half-reverted proxy.
pub async fn reset_proxy(config: &mut ProxyConfig) {
    if config.global_port.take().is_some() {
        if let Err(err) = platform::disable_global_proxy().await {
            warn!("Failed to revert global proxy: {err}");
        }
    }
    if config.env_port.take().is_some() {
        for (var, previous) in config.saved_env.drain() {
            match previous {
                Some(value) => std::env::set_var(&var, value),
                None => std::env::remove_var(&var),
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::ProxyError;
    use tokio::process::Command;

    // networksetup operates per network service; Wi-Fi covers the common
    // workstation case.
    const NETWORK_SERVICE: &str = "Wi-Fi";

    pub async fn enable_global_proxy(port: u16) -> Result<(), ProxyError> {
        run(&[
            "-setsocksfirewallproxy",
            NETWORK_SERVICE,
            "127.0.0.1",
            &port.to_string(),
        ])
        .await?;
        run(&["-setsocksfirewallproxystate", NETWORK_SERVICE, "on"]).await
    }

    pub async fn disable_global_proxy() -> Result<(), ProxyError> {
        run(&["-setsocksfirewallproxystate", NETWORK_SERVICE, "off"]).await
    }

    async fn run(args: &[&str]) -> Result<(), ProxyError> {
        let output = Command::new("networksetup").args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProxyError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::ProxyError;
    use tokio::process::Command;

    pub async fn enable_global_proxy(port: u16) -> Result<(), ProxyError> {
        gsettings(&["set", "org.gnome.system.proxy.socks", "host", "127.0.0.1"]).await?;
        gsettings(&[
            "set",
            "org.gnome.system.proxy.socks",
            "port",
            &port.to_string(),
        ])
        .await?;
        gsettings(&["set", "org.gnome.system.proxy", "mode", "manual"]).await
    }

    pub async fn disable_global_proxy() -> Result<(), ProxyError> {
        gsettings(&["set", "org.gnome.system.proxy", "mode", "none"]).await
    }

    async fn gsettings(args: &[&str]) -> Result<(), ProxyError> {
        let output = Command::new("gsettings").args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProxyError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
mod platform {
    use super::ProxyError;

    pub async fn enable_global_proxy(_port: u16) -> Result<(), ProxyError> {
        Err(ProxyError::Unsupported)
    }

    pub async fn disable_global_proxy() -> Result<(), ProxyError> {
        Err(ProxyError::Unsupported)
    }
}
