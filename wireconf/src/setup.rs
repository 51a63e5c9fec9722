// Server setup

//! First-run server configuration
//!
//! Setup fills in the server half of the domain: a key pair generated through
//! a [`KeyService`], the public endpoint and the UDP listen port. Completing
//! setup marks the server ready, after which the generated firewall script
//! also opens the listen port.

use crate::error::{Error, Result};
use crate::keys::KeyService;
use crate::store::DomainStore;
use crate::tools::ToolRunner;
use crate::types::ServerConfig;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Host tools a working installation needs
const REQUIRED_TOOLS: [&str; 4] = ["wg", "wg-quick", "ip", "iptables"];

/// How far server setup has progressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupStatus {
    pub installed: bool,
    pub setup_completed: bool,
    /// Endpoint and private key are both present
    pub server_configured: bool,
    pub server_endpoint: Option<String>,
    pub server_port: u16,
    pub server_public_key: Option<String>,
    /// The deployed interface config already has content
    pub has_existing_host_config: bool,
}

fn has_private_key(server: &ServerConfig) -> bool {
    server.private_key.as_deref().is_some_and(|k| !k.is_empty())
}

async fn fill_keys<K: KeyService>(server: &mut ServerConfig, keys: &K) -> Result<()> {
    let private_key = keys.generate_private_key().await?;
    let public_key = keys.derive_public_key(&private_key).await?;
    server.private_key = Some(private_key);
    server.public_key = Some(public_key);
    Ok(())
}

async fn missing_tools(tools: &ToolRunner) -> Vec<&'static str> {
    let mut missing = Vec::new();
    for tool in REQUIRED_TOOLS {
        if tools.resolve(tool).await.is_err() {
            missing.push(tool);
        }
    }
    missing
}

/// Generate a new server key pair and store it. Returns the public key.
///
/// Any existing pair is replaced, so every client config handed out before
/// has to be regenerated.
pub async fn generate_server_keys<K: KeyService>(store: &dyn DomainStore, keys: &K) -> Result<String> {
    store.invalidate();
    let mut snapshot = store.load()?;
    fill_keys(&mut snapshot.server, keys).await?;
    store.save(&snapshot)?;

    log::info!("Generated new server key pair");
    Ok(snapshot.server.public_key.unwrap_or_default())
}

/// Record the public endpoint and listen port, generating the key pair on
/// first use
pub async fn configure_server<K: KeyService>(
    store: &dyn DomainStore,
    keys: &K,
    endpoint: &str,
    port: u16,
) -> Result<ServerConfig> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(Error::ConfigurationIncomplete {
            missing: "server endpoint".to_string(),
        });
    }
    if port == 0 {
        return Err(Error::ConfigurationIncomplete {
            missing: "server listen port".to_string(),
        });
    }

    store.invalidate();
    let mut snapshot = store.load()?;
    if !has_private_key(&snapshot.server) {
        fill_keys(&mut snapshot.server, keys).await?;
        log::info!("Generated server key pair");
    }
    snapshot.server.endpoint = Some(endpoint.to_string());
    snapshot.server.port = port;
    store.save(&snapshot)?;

    log::info!("Server configured for {}:{}", endpoint, port);
    Ok(snapshot.server)
}

/// Mark setup as finished. The next commit opens the listen port.
///
/// # Errors
///
/// [`Error::ConfigurationIncomplete`] until [`configure_server`] has run.
pub async fn complete_setup(store: &dyn DomainStore, tools: &ToolRunner) -> Result<ServerConfig> {
    store.invalidate();
    let mut snapshot = store.load()?;
    if snapshot.server.endpoint.is_none() || !has_private_key(&snapshot.server) {
        return Err(Error::ConfigurationIncomplete {
            missing: "server endpoint and keys (configure the server first)".to_string(),
        });
    }

    let missing = missing_tools(tools).await;
    if missing.is_empty() {
        snapshot.server.installed = true;
    } else {
        log::warn!("Host tools not found: {}", missing.join(", "));
    }
    snapshot.server.setup_completed = true;
    store.save(&snapshot)?;

    log::info!("Setup completed");
    Ok(snapshot.server)
}

/// Report setup progress. `wg_config` is the deployed interface config.
pub async fn setup_status(store: &dyn DomainStore, tools: &ToolRunner, wg_config: &Path) -> Result<SetupStatus> {
    store.invalidate();
    let server = store.load()?.server;
    let installed = server.installed || missing_tools(tools).await.is_empty();
    let has_existing_host_config = fs::read_to_string(wg_config)
        .map(|content| !content.trim().is_empty())
        .unwrap_or(false);

    Ok(SetupStatus {
        installed,
        setup_completed: server.setup_completed,
        server_configured: server.endpoint.is_some() && has_private_key(&server),
        server_endpoint: server.endpoint,
        server_port: server.port,
        server_public_key: server.public_key,
        has_existing_host_config,
    })
}
