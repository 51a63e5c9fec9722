// Commit pipeline

//! Render, diff and activate
//!
//! A commit renders the interface config and firewall script from the current
//! domain snapshot, compares them with what is deployed on disk and picks the
//! least disruptive activation:
//!
//! - interface section changed: full restart
//! - only peers changed: hot reload, then re-apply the firewall
//! - only the firewall script changed: re-apply the firewall
//! - nothing changed: no activation
//!
//! Everything that can fail before touching the host (missing server key,
//! invalid addresses) is returned as `Err`. Failures after the artifacts are
//! written are reported as [`CommitStatus::Degraded`].

use crate::config::Paths;
use crate::error::{Error, Result};
use crate::executor::Deployer;
use crate::render::{interface_part, peer_blocks, render_client_config, ConfigRenderer};
use crate::store::DomainStore;
use crate::types::DomainSnapshot;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a commit is activated on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FullRestart,
    HotReload,
    FirewallOnly,
    NoChange,
}

/// Outcome of the activation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Applied,
    /// Artifacts are written but activation failed
    Degraded(String),
}

/// Result of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub strategy: Strategy,
    pub status: CommitStatus,
    pub config_path: PathBuf,
}

impl CommitReport {
    pub fn is_degraded(&self) -> bool {
        matches!(self.status, CommitStatus::Degraded(_))
    }
}

/// A peer present in the new config but not in the deployed one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedClient {
    pub name: String,
    pub id: Option<u32>,
}

/// What a commit would change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added_clients: Vec<AddedClient>,
    /// Truncated public keys of peers that would disappear
    pub removed_clients: Vec<String>,
    pub modified_interface: bool,
    pub modified_peers: bool,
    pub modified_rules: bool,
}

/// Dry-run view of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitPreview {
    pub summary: DiffSummary,
    pub strategy: Strategy,
    pub full_restart_needed: bool,
    pub new_config: String,
}

/// Anything able to push the current domain state to the host again.
/// The transaction guard uses it to redeploy after a revert.
pub trait Redeploy: Send + Sync + 'static {
    fn redeploy(&self) -> impl Future<Output = Result<CommitReport>> + Send;
}

struct Rendered {
    snapshot: DomainSnapshot,
    config: String,
    script: String,
}

/// Comparison of freshly rendered artifacts with the deployed ones
struct Changes {
    previous_config: Option<String>,
    interface: bool,
    config: bool,
    script: bool,
}

impl Changes {
    fn detect(paths: &Paths, rendered: &Rendered) -> Result<Self> {
        let previous_config = read_optional(&paths.wg_config)?;
        let previous_script = read_optional(&paths.firewall_script)?;

        let (interface, config) = match previous_config.as_deref() {
            Some(old) => (
                interface_part(old) != interface_part(&rendered.config),
                old != rendered.config,
            ),
            None => (true, true),
        };
        let script = previous_script.as_deref() != Some(rendered.script.as_str());

        Ok(Self {
            previous_config,
            interface,
            config,
            script,
        })
    }

    fn strategy(&self) -> Strategy {
        if self.interface {
            Strategy::FullRestart
        } else if self.config {
            Strategy::HotReload
        } else if self.script {
            Strategy::FirewallOnly
        } else {
            Strategy::NoChange
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn truncated_key(key: &str) -> String {
    format!("{}...", key.chars().take(8).collect::<String>())
}

/// Drives a commit from domain snapshot to live host
pub struct CommitOrchestrator<D> {
    store: Arc<dyn DomainStore>,
    deployer: D,
    renderer: ConfigRenderer,
    paths: Paths,
}

impl<D: Deployer> CommitOrchestrator<D> {
    pub fn new(store: Arc<dyn DomainStore>, deployer: D, paths: Paths, mtu: u16) -> Self {
        let renderer = ConfigRenderer::new(paths.interface.clone(), paths.firewall_script.clone(), mtu);
        Self {
            store,
            deployer,
            renderer,
            paths,
        }
    }

    pub fn deployer(&self) -> &D {
        &self.deployer
    }

    /// Re-read the domain so edits made by other processes are picked up
    fn current(&self) -> Result<DomainSnapshot> {
        self.store.invalidate();
        self.store.load()
    }

    fn render(&self) -> Result<Rendered> {
        let snapshot = self.current()?;
        let private_key = snapshot
            .server
            .private_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::ConfigurationIncomplete {
                missing: "server private key (complete setup first)".to_string(),
            })?;

        let config = self
            .renderer
            .render_interface_config(private_key, snapshot.server.port, &snapshot)?;
        let script = self.renderer.render_firewall_script(&snapshot)?;

        Ok(Rendered {
            snapshot,
            config,
            script,
        })
    }

    /// Render the current domain and push it to the host
    pub async fn commit(&self) -> Result<CommitReport> {
        let rendered = self.render()?;
        let changes = Changes::detect(&self.paths, &rendered)?;
        let strategy = changes.strategy();

        log::info!(
            "Committing {} with strategy {:?}",
            self.paths.wg_config.display(),
            strategy
        );

        let status = match self.activate(strategy, &rendered).await {
            Ok(()) => CommitStatus::Applied,
            Err(e) => {
                log::error!("Commit activation failed: {}", e);
                CommitStatus::Degraded(e.to_string())
            }
        };

        Ok(CommitReport {
            strategy,
            status,
            config_path: self.paths.wg_config.clone(),
        })
    }

    async fn activate(&self, strategy: Strategy, rendered: &Rendered) -> Result<()> {
        // PostUp of the interface config runs this script
        self.deployer
            .install_firewall(&rendered.script, &self.paths.firewall_script)?;

        match strategy {
            Strategy::FullRestart => {
                self.deployer
                    .full_restart(&rendered.config, &self.paths.wg_config)
                    .await
            }
            Strategy::HotReload => {
                self.deployer
                    .hot_reload(&rendered.config, &self.paths.wg_config)
                    .await?;
                self.deployer
                    .apply_firewall(&rendered.script, &self.paths.firewall_script)
                    .await
            }
            Strategy::FirewallOnly => {
                self.deployer
                    .apply_firewall(&rendered.script, &self.paths.firewall_script)
                    .await
            }
            Strategy::NoChange => Ok(()),
        }
    }

    /// Same render and diff as [`commit`](Self::commit), without touching the host
    pub fn preview_commit(&self) -> Result<CommitPreview> {
        let rendered = self.render()?;
        let changes = Changes::detect(&self.paths, &rendered)?;

        let old_peers = changes
            .previous_config
            .as_deref()
            .map(peer_blocks)
            .unwrap_or_default();
        let new_peers = peer_blocks(&rendered.config);

        let added_clients = new_peers
            .keys()
            .filter(|key| !old_peers.contains_key(*key))
            .map(|key| {
                match rendered.snapshot.clients.iter().find(|c| &c.public_key == key) {
                    Some(client) => AddedClient {
                        name: client.name.clone(),
                        id: Some(client.id),
                    },
                    None => AddedClient {
                        name: key.clone(),
                        id: None,
                    },
                }
            })
            .collect();
        let removed_clients = old_peers
            .keys()
            .filter(|key| !new_peers.contains_key(*key))
            .map(|key| truncated_key(key))
            .collect();

        let strategy = changes.strategy();
        Ok(CommitPreview {
            summary: DiffSummary {
                added_clients,
                removed_clients,
                modified_interface: changes.interface,
                modified_peers: changes.config,
                modified_rules: changes.script,
            },
            strategy,
            full_restart_needed: strategy == Strategy::FullRestart,
            new_config: rendered.config,
        })
    }

    /// Render the peer file handed out to client `name`
    pub fn render_client_config_for(&self, name: &str) -> Result<String> {
        let snapshot = self.current()?;
        let client = snapshot
            .client_by_name(name)
            .ok_or_else(|| Error::ClientNotFound {
                name: name.to_string(),
            })?;

        let public_key = snapshot
            .server
            .public_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::ConfigurationIncomplete {
                missing: "server public key".to_string(),
            })?;
        let endpoint = snapshot
            .server
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::ConfigurationIncomplete {
                missing: "server endpoint".to_string(),
            })?;

        render_client_config(
            &snapshot,
            client,
            public_key,
            &format!("{}:{}", endpoint, snapshot.server.port),
            &snapshot.other_routes(client.id),
        )
    }
}

impl<D: Deployer + 'static> Redeploy for CommitOrchestrator<D> {
    async fn redeploy(&self) -> Result<CommitReport> {
        self.commit().await
    }
}
