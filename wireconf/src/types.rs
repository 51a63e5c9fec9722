// Shared types between the store, renderer and deployment engine

//! Shared data structures
//!
//! This module defines the read-only domain snapshot handed to the core by the
//! persistence layer, the transaction state machine types, and the daemon
//! configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A VPN network served on the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: u32,
    pub name: String,
    /// Network in CIDR notation, e.g. `10.0.1.0/24`
    pub cidr: String,
    /// Server-side address on the interface, e.g. `10.0.1.1/24`
    pub interface_address: String,
}

impl Network {
    /// Gateway address without prefix length (`10.0.1.1/24` -> `10.0.1.1`)
    pub fn gateway(&self) -> &str {
        self.interface_address
            .split('/')
            .next()
            .unwrap_or(&self.interface_address)
    }
}

/// How a client's peer file announces DNS servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// Use the gateway address of every network the client belongs to
    #[default]
    Default,
    /// Use the client's stored comma-separated list
    Custom,
    /// Emit no DNS line
    None,
}

/// A WireGuard peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: u32,
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Final address byte, identical across every network of the client
    pub octet: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keepalive: Option<u16>,
    #[serde(default)]
    pub dns_mode: DnsMode,
    #[serde(default)]
    pub dns_servers: Option<String>,
    /// Ids of the networks this client belongs to, in membership order
    #[serde(default)]
    pub network_ids: Vec<u32>,
}

/// Traffic for `target_cidr` is routed through `via_client_id` (router mode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: u32,
    pub target_cidr: String,
    pub via_client_id: u32,
}

/// Transport protocol matched by an access rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    #[default]
    Udp,
    All,
}

impl Protocol {
    /// iptables `-p` argument, `None` for [`Protocol::All`]
    pub fn as_match(&self) -> Option<&'static str> {
        match self {
            Protocol::Tcp => Some("tcp"),
            Protocol::Udp => Some("udp"),
            Protocol::All => None,
        }
    }
}

/// Terminal verdict of an access rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    #[default]
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "DROP")]
    Drop,
}

impl RuleAction {
    /// iptables jump target
    pub fn target(&self) -> &'static str {
        match self {
            RuleAction::Accept => "ACCEPT",
            RuleAction::Drop => "DROP",
        }
    }
}

/// Whether a rule's destination names a single host or a network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    #[default]
    Host,
    Network,
}

/// Firewall rule between tunnel peers and destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: u32,
    #[serde(default)]
    pub source_client_id: Option<u32>,
    #[serde(default)]
    pub dest_client_id: Option<u32>,
    #[serde(default)]
    pub dest_cidr: Option<String>,
    #[serde(default)]
    pub destination_type: DestinationType,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default)]
    pub action: RuleAction,
    /// Ordering within an action group; lower values are emitted first
    #[serde(default)]
    pub priority: i32,
}

/// Singleton server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// Public host name or address, without port
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub setup_completed: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            public_key: None,
            endpoint: None,
            port: default_listen_port(),
            installed: false,
            setup_completed: false,
        }
    }
}

/// Consistent read-only view of the domain, as supplied by the persistence layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

impl DomainSnapshot {
    /// Look up a client by id
    pub fn client(&self, id: u32) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Look up a client by name
    pub fn client_by_name(&self, name: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Networks a client belongs to, in membership order.
    /// Ids that do not resolve to a network are skipped.
    pub fn client_networks<'a>(&'a self, client: &'a Client) -> impl Iterator<Item = &'a Network> {
        client
            .network_ids
            .iter()
            .filter_map(move |id| self.networks.iter().find(|n| n.id == *id))
    }

    /// Routes for which `client_id` is the gateway
    pub fn routes_via(&self, client_id: u32) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(move |r| r.via_client_id == client_id)
    }

    /// Target CIDRs of routes owned by every client other than `client_id`
    pub fn other_routes(&self, client_id: u32) -> Vec<String> {
        self.routes
            .iter()
            .filter(|r| r.via_client_id != client_id)
            .map(|r| r.target_cidr.clone())
            .collect()
    }
}

/// Commit-confirm transaction states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// No change awaiting confirmation
    Idle,
    /// A commit is provisional until `expires_at` (unix seconds)
    Pending { id: String, expires_at: u64 },
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Live interface config file; the file stem names the interface
    #[serde(default = "default_wg_config_path")]
    pub wg_config_path: PathBuf,
    /// Directory holding the domain store, its baseline and the sidecar
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Upper bound for every external tool invocation (seconds)
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            wg_config_path: default_wg_config_path(),
            state_dir: default_state_dir(),
            log_level: default_log_level(),
            mtu: default_mtu(),
            tool_timeout: default_tool_timeout(),
        }
    }
}

// Default values for configuration
fn default_wg_config_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wireconf")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mtu() -> u16 {
    1420
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_listen_port() -> u16 {
    51820
}

fn default_enabled() -> bool {
    true
}
