// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file, applying the
//! `WG_CONFIG_PATH` environment override, validating values, and deriving the
//! on-disk locations of every deployment artifact.

use crate::executor::validate_interface_name;
use crate::types::{Config, GeneralConfig};
use anyhow::{Context, Result};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Environment variable overriding `general.wg_config_path`
pub const WG_CONFIG_PATH_ENV: &str = "WG_CONFIG_PATH";

/// Load configuration from a TOML file.
///
/// A missing file yields the built-in defaults; an unreadable or invalid one
/// is an error.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let mut config: Config = if path.exists() {
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&contents).context("Failed to parse config file")?
    } else {
        Config::default()
    };

    if let Ok(wg_path) = std::env::var(WG_CONFIG_PATH_ENV) {
        if !wg_path.is_empty() {
            config.general.wg_config_path = PathBuf::from(wg_path);
        }
    }

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    let general = &config.general;

    let interface = interface_name(&general.wg_config_path)
        .context("wg_config_path must name a file such as /etc/wireguard/wg0.conf")?;
    validate_interface_name(&interface).context("wg_config_path names an invalid interface")?;

    if general.state_dir.as_os_str().is_empty() {
        anyhow::bail!("state_dir cannot be empty");
    }

    if !(1280..=9000).contains(&general.mtu) {
        anyhow::bail!("mtu must be between 1280 and 9000, got {}", general.mtu);
    }

    if general.tool_timeout == 0 {
        anyhow::bail!("tool_timeout must be > 0");
    }

    Ok(())
}

/// Interface name derived from the config file stem (`/etc/wireguard/wg0.conf` -> `wg0`)
pub fn interface_name(wg_config_path: &Path) -> Result<String> {
    wg_config_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive interface name from {:?}", wg_config_path))
}

/// Locations of every durable artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Tunnel interface name
    pub interface: String,
    /// Live interface config file
    pub wg_config: PathBuf,
    /// Companion firewall script invoked by PostUp/PostDown
    pub firewall_script: PathBuf,
    /// Domain store file
    pub domain_store: PathBuf,
    /// Last-known-good domain image
    pub baseline: PathBuf,
    /// Pending transaction sidecar record
    pub sidecar: PathBuf,
}

impl Paths {
    /// Derive all artifact paths from the general configuration
    pub fn from_config(general: &GeneralConfig) -> Result<Self> {
        let interface = interface_name(&general.wg_config_path)?;
        let dir = general
            .wg_config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let domain_store = general.state_dir.join("domain.json");

        Ok(Self {
            firewall_script: dir.join(format!("{}-rules.sh", interface)),
            wg_config: general.wg_config_path.clone(),
            baseline: general.state_dir.join("domain.json.last_good"),
            sidecar: general.state_dir.join("transaction.json"),
            domain_store,
            interface,
        })
    }
}

/// Parse CIDR notation into (network, mask) tuple
/// Returns network address and netmask as host-order integers of the big-endian octets
pub fn parse_cidr(cidr: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = cidr.trim().split('/').collect();
    if parts.len() != 2 {
        anyhow::bail!("Invalid CIDR format (expected X.X.X.X/N)");
    }

    let ip: Ipv4Addr = parts[0].parse().context("Invalid IP address")?;
    let prefix_len: u8 = parts[1].parse().context("Invalid prefix length")?;

    if prefix_len > 32 {
        anyhow::bail!("Prefix length must be <= 32");
    }

    let ip_u32 = u32::from_be_bytes(ip.octets());

    let mask = if prefix_len == 0 {
        0u32
    } else {
        !0u32 << (32 - prefix_len)
    };

    // Apply mask to get network address
    let network = ip_u32 & mask;

    Ok((network, mask))
}
