// WireGuard deployment executor

//! Applies rendered artifacts to the live host
//!
//! Three activation paths are available: firewall-only (re-run the generated
//! script), hot reload (`wg syncconf` without tearing the interface down) and
//! full restart (through the `wg-quick@` systemd unit when systemd is running
//! and the config lives where the unit reads it, otherwise `wg-quick`
//! directly). Every tool call goes through [`ToolRunner`].

use crate::error::Result;
use crate::state_file::write_atomic;
use crate::tools::ToolRunner;
use anyhow::Context;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wireguard_control::InterfaceName;

/// Present while systemd is the running init system
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";
/// Directory `wg-quick@<iface>` reads `<iface>.conf` from
const WG_QUICK_DIR: &str = "/etc/wireguard";

/// Validates that a name is safe to use in shell commands.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validates a tunnel interface name for use in shell commands and as a kernel
/// interface name.
///
/// # Errors
///
/// Returns an error if the name is empty, contains characters other than
/// alphanumerics, hyphens and underscores, or is too long for the kernel.
pub fn validate_interface_name(name: &str) -> anyhow::Result<()> {
    validate_name(name, "Interface name")?;
    let _: InterfaceName = name
        .parse()
        .with_context(|| format!("Invalid interface name: {}", name))?;
    Ok(())
}

/// Host-mutating operations used by the commit pipeline
pub trait Deployer: Send + Sync {
    /// Persist the firewall script without running it
    fn install_firewall(&self, script: &str, path: &Path) -> Result<()> {
        write_atomic(path, script.as_bytes(), 0o755)?;
        Ok(())
    }

    /// Write the firewall script and run it with `apply`
    fn apply_firewall(&self, script: &str, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Write the config and sync peers without interrupting traffic
    fn hot_reload(&self, config: &str, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Stop the interface, write the config and bring it back up
    fn full_restart(&self, config: &str, path: &Path) -> impl Future<Output = Result<()>> + Send;
}

/// Host locations that decide how an interface is restarted
#[derive(Debug, Clone)]
pub struct HostLayout {
    pub systemd_runtime_dir: PathBuf,
    pub wg_quick_dir: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            systemd_runtime_dir: PathBuf::from(SYSTEMD_RUNTIME_DIR),
            wg_quick_dir: PathBuf::from(WG_QUICK_DIR),
        }
    }
}

/// Deployer driving the real host tools
pub struct DeploymentExecutor {
    interface: String,
    tools: ToolRunner,
    layout: HostLayout,
}

impl DeploymentExecutor {
    /// Create an executor for `interface`
    ///
    /// # Errors
    ///
    /// Returns an error if the interface name is unsafe for shell use.
    pub fn new(interface: String, tool_timeout: Duration) -> anyhow::Result<Self> {
        Self::with_tools(interface, ToolRunner::new(tool_timeout), HostLayout::default())
    }

    /// Create an executor using `tools` and `layout` instead of the host defaults
    pub fn with_tools(interface: String, tools: ToolRunner, layout: HostLayout) -> anyhow::Result<Self> {
        validate_interface_name(&interface)?;

        Ok(Self {
            interface,
            tools,
            layout,
        })
    }

    /// Get the interface name
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn service_name(&self) -> String {
        format!("wg-quick@{}", self.interface)
    }

    /// Check if the tunnel interface currently exists
    pub async fn interface_exists(&self) -> Result<bool> {
        let output = self
            .tools
            .output("ip", &["link", "show", &self.interface], None)
            .await?;
        Ok(output.status.success())
    }

    /// Prefer the init system when it runs and its unit would read `path`
    async fn uses_systemd(&self, path: &Path) -> bool {
        let unit_config = self.layout.wg_quick_dir.join(format!("{}.conf", self.interface));
        if path != unit_config {
            log::debug!(
                "{} is not read by {}, using wg-quick directly",
                path.display(),
                self.service_name()
            );
            return false;
        }
        self.layout.systemd_runtime_dir.exists() && self.tools.resolve("systemctl").await.is_ok()
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("non UTF-8 path: {}", path.display()),
        )
        .into()
    })
}

impl Deployer for DeploymentExecutor {
    async fn apply_firewall(&self, script: &str, path: &Path) -> Result<()> {
        self.install_firewall(script, path)?;
        log::info!("Applying firewall rules from {}", path.display());
        self.tools.run_program(path, &["apply"]).await?;
        Ok(())
    }

    async fn hot_reload(&self, config: &str, path: &Path) -> Result<()> {
        write_atomic(path, config.as_bytes(), 0o600)?;

        if !self.interface_exists().await? {
            log::info!("Interface {} is down, starting it instead of reloading", self.interface);
            return self.full_restart(config, path).await;
        }

        log::info!("Hot-reloading peers on {}", self.interface);
        let stripped = self
            .tools
            .run("wg-quick", &["strip", path_arg(path)?], None)
            .await?
            .stdout;
        self.tools
            .run("wg", &["syncconf", &self.interface, "/dev/stdin"], Some(&stripped))
            .await?;

        log::info!("Peers on {} synchronized", self.interface);
        Ok(())
    }

    async fn full_restart(&self, config: &str, path: &Path) -> Result<()> {
        let systemd = self.uses_systemd(path).await;
        let service = self.service_name();

        // Stop with the old config still on disk so its PostDown hooks run
        if systemd {
            log::info!("Stopping {}", service);
            if let Err(e) = self.tools.run("systemctl", &["stop", &service], None).await {
                log::warn!("systemctl stop {} failed: {}", service, e);
            }
        } else if self.interface_exists().await? {
            log::info!("Bringing down WireGuard interface: {}", self.interface);
            if let Err(e) = self.tools.run("wg-quick", &["down", path_arg(path)?], None).await {
                log::warn!("wg-quick down failed: {}", e);
            }
        }

        write_atomic(path, config.as_bytes(), 0o600)?;

        if systemd {
            log::info!("Starting {}", service);
            self.tools.run("systemctl", &["start", &service], None).await?;
        } else {
            log::info!("Bringing up WireGuard interface: {}", self.interface);
            self.tools.run("wg-quick", &["up", path_arg(path)?], None).await?;
        }

        log::info!("WireGuard interface {} is up", self.interface);
        Ok(())
    }
}
