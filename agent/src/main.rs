use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod check;
mod config;
mod connection;
mod error;
mod reverse;

use check::{CheckProvider, StaticCheck};
use config::RevAgentConfig;
use reverse::Reverse;

#[derive(Parser)]
#[command(name = "revagent")]
#[command(author = "RevAgent Team")]
#[command(version = "0.1.0")]
#[command(about = "Serve local metrics to brokers over reverse connections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: revagent.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the local agent address CONNECT requests are relayed to
    #[arg(short, long)]
    agent_address: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Maintain the reverse connection (default)
    Run,
    /// Check the configuration and print the owning broker
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "revagent=debug" } else { "revagent=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let path = match cli.config {
        Some(path) => path,
        None => RevAgentConfig::find_config()
            .context("No config file found (looked for revagent.yml in the current and home directory)")?,
    };
    let mut config = RevAgentConfig::load(&path)?;
    if let Some(agent_address) = cli.agent_address {
        config.agent_address = agent_address;
        config.validate()?;
    }
    info!("Loaded config from {}", path.display());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(path, config).await,
        Commands::Validate => validate(config).await,
    }
}

/// Run the ownership loop until Ctrl+C or a fatal error
async fn run(path: PathBuf, config: RevAgentConfig) -> Result<()> {
    let settings = Arc::new(config.reverse.settings());
    let provider = StaticCheck::with_reload(path, config.check);
    let mut reverse = Reverse::new(provider, config.agent_address.clone(), settings);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                cancel.cancel();
            }
        });
    }

    info!("Relaying broker requests to {}", config.agent_address);
    if let Err(e) = reverse.start(cancel).await {
        error!("Reverse connection stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Resolve brokers and the owner the same way `run` does, without dialing
async fn validate(config: RevAgentConfig) -> Result<()> {
    let mut provider = StaticCheck::new(config.check);
    provider.refresh_check_config().await?;
    let configs = provider.get_reverse_configs()?;
    let owner = provider.find_primary_broker_instance(&configs).await?;

    let mut cns: Vec<_> = configs.keys().collect();
    cns.sort();

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  ✅ RevAgent config OK                                       ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Agent:      {:<47} ║", config.agent_address);
    for cn in cns {
        let broker = &configs[cn];
        let tag = if *cn == owner { " (owner)" } else { "" };
        println!(
            "║  Broker:     {:<47} ║",
            format!("{} {}{}", cn, broker.broker_addr, tag)
        );
    }
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    Ok(())
}
