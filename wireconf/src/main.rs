// WireGuard safe-deployment CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use wireconf::{
    config::{load_config, Paths},
    error::Error,
    executor::DeploymentExecutor,
    keys::{KeyService, NativeKeys, WgToolKeys},
    orchestrator::CommitOrchestrator,
    setup,
    signals::ShutdownSignals,
    state::{Recovery, TransactionGuard, CONFIRM_WINDOW},
    state_file::SidecarFile,
    store::{Baseline, DomainStore, JsonFileStore},
    tools::ToolRunner,
    types::Config,
};

type Engine = CommitOrchestrator<DeploymentExecutor>;

#[derive(Parser)]
#[command(name = "wireconf")]
#[command(about = "Safe WireGuard configuration deployment", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wireconf/config.toml")]
    config: PathBuf,

    /// Use the `wg` tool instead of in-process key generation
    #[arg(long, global = true)]
    use_wg: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what a commit would change, as JSON
    Preview,
    /// Render and deploy the current configuration
    Commit,
    /// Deploy provisionally; revert unless confirmed within the window
    Try,
    /// Resolve a transaction left pending by a previous run; run this at boot
    Recover,
    /// Configure the server endpoint and port, generating keys if needed
    Setup {
        /// Public host name or address clients connect to
        #[arg(long)]
        endpoint: String,
        /// UDP listen port
        #[arg(long, default_value_t = 51820)]
        port: u16,
    },
    /// Show setup progress, as JSON
    Status,
    /// Replace the server key pair
    RotateServerKeys,
    /// Print the peer file for a client
    ClientConfig {
        /// Client name
        name: String,
    },
    /// Generate a private key
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
    /// Generate a preshared key
    Genpsk,
}

fn main() -> Result<()> {
    // Commands are short-lived; 2 threads cover tool spawns and the deadline task
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wireconf")
        .enable_time()
        .enable_io()
        .build()?;

    let result = runtime.block_on(async_main());
    // An unanswered confirmation prompt leaves a blocking stdin read behind
    runtime.shutdown_background();
    result
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    match &args.command {
        Command::Genkey | Command::Pubkey | Command::Genpsk => {
            if args.use_wg {
                let keys = WgToolKeys::new(Duration::from_secs(config.general.tool_timeout));
                run_key_command(&keys, &args.command).await
            } else {
                run_key_command(&NativeKeys, &args.command).await
            }
        }
        Command::Preview => {
            let (engine, _) = build_engine(&config)?;
            print_json(&engine.preview_commit()?)
        }
        Command::ClientConfig { name } => {
            let (engine, _) = build_engine(&config)?;
            print!("{}", engine.render_client_config_for(name)?);
            Ok(())
        }
        Command::Commit => {
            let (engine, guard) = build_engine(&config)?;
            refuse_if_pending(&guard).await?;

            let report = engine.commit().await?;
            if report.is_degraded() {
                log::warn!("Configuration written but activation failed");
            }
            print_json(&report)
        }
        Command::Try => {
            let (_, guard) = build_engine(&config)?;
            refuse_if_pending(&guard).await?;

            // Installed first so a hangup during deployment is not fatal
            let mut signals = ShutdownSignals::install()?;
            let (id, report) = guard.commit_provisional().await?;
            print_json(&report)?;
            await_confirmation(&guard, id, &mut signals).await
        }
        Command::Recover => {
            let (_, guard) = build_engine(&config)?;
            let mut signals = ShutdownSignals::install()?;
            match guard.init().await? {
                Recovery::Clean => {
                    println!("No pending transaction");
                    Ok(())
                }
                Recovery::Reverted(report) => {
                    println!("Expired transaction reverted");
                    print_json(&report)
                }
                Recovery::Resumed { id, remaining } => {
                    println!(
                        "Transaction {} is still pending, reverting in {}s",
                        id,
                        remaining.as_secs()
                    );
                    await_deadline(&guard, &mut signals).await
                }
            }
        }
        Command::Setup { endpoint, port } => {
            let paths = Paths::from_config(&config.general)?;
            let store = JsonFileStore::new(&paths.domain_store);
            let tools = ToolRunner::new(Duration::from_secs(config.general.tool_timeout));

            if args.use_wg {
                let keys = WgToolKeys::new(Duration::from_secs(config.general.tool_timeout));
                setup::configure_server(&store, &keys, endpoint, *port).await?;
            } else {
                setup::configure_server(&store, &NativeKeys, endpoint, *port).await?;
            }
            setup::complete_setup(&store, &tools).await?;
            print_json(&setup::setup_status(&store, &tools, &paths.wg_config).await?)
        }
        Command::Status => {
            let paths = Paths::from_config(&config.general)?;
            let store = JsonFileStore::new(&paths.domain_store);
            let tools = ToolRunner::new(Duration::from_secs(config.general.tool_timeout));
            print_json(&setup::setup_status(&store, &tools, &paths.wg_config).await?)
        }
        Command::RotateServerKeys => {
            let paths = Paths::from_config(&config.general)?;
            let store = JsonFileStore::new(&paths.domain_store);
            let public_key = if args.use_wg {
                let keys = WgToolKeys::new(Duration::from_secs(config.general.tool_timeout));
                setup::generate_server_keys(&store, &keys).await?
            } else {
                setup::generate_server_keys(&store, &NativeKeys).await?
            };
            log::warn!("Server key replaced; existing client configs must be reissued");
            println!("{}", public_key);
            Ok(())
        }
    }
}

fn build_engine(config: &Config) -> Result<(Arc<Engine>, TransactionGuard<Engine>)> {
    let paths = Paths::from_config(&config.general)?;
    let store: Arc<dyn DomainStore> = Arc::new(JsonFileStore::new(&paths.domain_store));

    let executor = DeploymentExecutor::new(
        paths.interface.clone(),
        Duration::from_secs(config.general.tool_timeout),
    )
    .context("Failed to initialize deployment executor")?;

    let baseline = Baseline::new(&paths.baseline);
    let sidecar = SidecarFile::new(&paths.sidecar);
    let engine = Arc::new(CommitOrchestrator::new(
        Arc::clone(&store),
        executor,
        paths,
        config.general.mtu,
    ));
    let guard = TransactionGuard::new(store, baseline, sidecar, Arc::clone(&engine));

    Ok((engine, guard))
}

/// Run startup recovery; a transaction resumed from a previous run blocks new commits
async fn refuse_if_pending(guard: &TransactionGuard<Engine>) -> Result<()> {
    match guard.init().await? {
        Recovery::Resumed { id, .. } => Err(Error::TransactionConflict { id }.into()),
        Recovery::Reverted(report) => {
            log::warn!("Reverted a transaction that expired while wireconf was not running");
            print_json(&report)
        }
        Recovery::Clean => Ok(()),
    }
}

/// Prompt for confirmation until the window closes
async fn await_confirmation(
    guard: &TransactionGuard<Engine>,
    id: String,
    signals: &mut ShutdownSignals,
) -> Result<()> {
    println!(
        "Keep this configuration? It is reverted in {}s unless confirmed [y/N]",
        CONFIRM_WINDOW.as_secs()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tokio::select! {
        line = lines.next_line() => {
            // EOF or a read error once the terminal is gone
            let answer = line.unwrap_or_default().unwrap_or_default();
            if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                if !guard.confirm_transaction(&id).await {
                    return Err(Error::TransactionStale { id }.into());
                }
                println!("Configuration confirmed");
                Ok(())
            } else {
                revert(guard).await
            }
        }
        name = signals.recv() => {
            log::warn!("Received {}, reverting", name);
            revert(guard).await
        }
        result = guard.wait_until_idle() => {
            result?;
            println!("Not confirmed in time, previous configuration restored");
            Ok(())
        }
    }
}

/// Let a resumed transaction run out, reverting early on a termination signal
async fn await_deadline(guard: &TransactionGuard<Engine>, signals: &mut ShutdownSignals) -> Result<()> {
    tokio::select! {
        name = signals.recv() => {
            log::warn!("Received {}, reverting", name);
            revert(guard).await
        }
        result = guard.wait_until_idle() => {
            result?;
            log::info!("Pending transaction resolved");
            Ok(())
        }
    }
}

/// Abort the pending transaction. Reports through the log only, since the
/// terminal may already be gone.
async fn revert(guard: &TransactionGuard<Engine>) -> Result<()> {
    if let Some(report) = guard.abort_transaction().await? {
        if report.is_degraded() {
            log::error!("Previous configuration restored but activation failed: {:?}", report.status);
        } else {
            log::warn!("Previous configuration restored ({:?})", report.strategy);
        }
    }
    Ok(())
}

async fn run_key_command<K: KeyService>(keys: &K, command: &Command) -> Result<()> {
    let key = match command {
        Command::Genkey => keys.generate_private_key().await?,
        Command::Genpsk => keys.generate_preshared_key().await?,
        Command::Pubkey => {
            let mut private_key = String::new();
            tokio::io::stdin()
                .read_to_string(&mut private_key)
                .await
                .context("Failed to read private key from stdin")?;
            keys.derive_public_key(&private_key).await?
        }
        _ => anyhow::bail!("not a key command"),
    };
    println!("{}", key);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
