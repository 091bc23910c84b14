//! keystone — self-certifying build orchestrator
//!
//! Usage:
//!   keystone run --config keystone.toml --manifests ./nodes   → register manifests and run
//!   keystone status --config keystone.toml                    → print persisted status
//!   keystone init-config                                      → print the default config

use anyhow::Context;
use clap::{Parser, Subcommand};
use keystone_core::{KeystoneConfig, Manifest};
use keystone_orchestrator::BuilderRegistry;
use keystone::Keystone;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(
    name = "keystone",
    about = "Self-certifying build orchestration over a dependency graph",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every manifest in a directory and run until Ctrl-C
    Run {
        /// Path to config file (TOML)
        #[arg(short, long, default_value = "keystone.toml")]
        config: PathBuf,
        /// Directory of *.json / *.yaml manifests
        #[arg(short, long)]
        manifests: Option<PathBuf>,
    },
    /// Print the persisted status as JSON
    Status {
        #[arg(short, long, default_value = "keystone.toml")]
        config: PathBuf,
    },
    /// Print the default configuration as TOML
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_json, cli.log_dir.as_deref());

    match cli.command {
        Commands::Run { config, manifests } => run(&config, manifests.as_deref()).await?,
        Commands::Status { config } => {
            let config = KeystoneConfig::load(&config);
            let report = Keystone::inspect(&config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::InitConfig => print!("{}", KeystoneConfig::default().to_toml()),
    }

    Ok(())
}

fn init_tracing(
    json: bool,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "keystone=info".into())
    };
    let stderr = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "keystone.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

async fn run(config_path: &Path, manifests: Option<&Path>) -> anyhow::Result<()> {
    let config = KeystoneConfig::load(config_path);
    let keystone = Keystone::open(config, BuilderRegistry::new())
        .await
        .context("failed to start keystone")?;

    if let Some(dir) = manifests {
        let loaded = load_manifests(dir)?;
        let snapshot = keystone.registry().snapshot();
        // Manifests already stored at the same version are left alone.
        let changed: Vec<Manifest> = loaded
            .into_iter()
            .filter(|m| snapshot.get(&m.id).map(|s| s.version) != Some(m.version))
            .collect();
        if changed.is_empty() {
            tracing::info!(dir = %dir.display(), "all manifests up to date");
        } else {
            let change = keystone.register_all(changed).await?;
            tracing::info!(
                added = change.added.len(),
                edited = change.edited.len(),
                graph_version = change.graph_version,
                "manifests registered"
            );
        }
    }

    tracing::info!("running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    keystone.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&keystone.status())?);
    Ok(())
}

fn load_manifests(dir: &Path) -> anyhow::Result<Vec<Manifest>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read manifest dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("json" | "yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let manifest: Manifest = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid manifest {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid manifest {}", path.display()))?
        };
        manifests.push(manifest);
    }
    Ok(manifests)
}
