//! # AS4 Relay Configuration Validator
//!
//! Command-line tool for validating relay configuration files before the
//! relay is started against them.

use anyhow::{bail, Context};
use as4_relay::config::loader::DEFAULT_CONFIG_PATH;
use as4_relay::config::{ConfigLoader, RelayConfig, StoreBackend};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate AS4 relay configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: config/as4-relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the whole configuration
    All,

    /// Validate one section
    Component {
        /// Section name (database, store, agents, pull, body_store, receive)
        name: String,
    },

    /// Print the effective configuration as JSON
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = load(&cli).and_then(|config| match &cli.command {
        Some(Commands::All) | None => validate_all(&config),
        Some(Commands::Component { name }) => validate_component(&config, name),
        Some(Commands::Show) => show(&config),
    });

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            println!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let path = cli.config.as_deref();
    println!("🔧 Validating AS4 Relay Configuration");
    println!(
        "Config file: {}",
        path.map_or(DEFAULT_CONFIG_PATH.to_string(), |p| p.display().to_string())
    );
    println!("Environment: {}", ConfigLoader::detect_environment());
    println!();

    let config = ConfigLoader::load(path).context("failed to load configuration")?;
    println!("✅ Configuration loaded");
    Ok(config)
}

fn validate_all(config: &RelayConfig) -> anyhow::Result<()> {
    for section in ["database", "store", "agents", "pull", "body_store", "receive"] {
        validate_component(config, section)?;
    }
    config.validate().context("cross-section validation failed")?;
    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(config: &RelayConfig, name: &str) -> anyhow::Result<()> {
    match name.to_lowercase().replace('-', "_").as_str() {
        "database" => {
            println!("🗄️  Database");
            match &config.database.url {
                Some(url) if url.is_empty() => bail!("database.url is configured but empty"),
                Some(_) => println!("   ✅ URL configured"),
                None => println!("   ℹ️  URL not configured"),
            }
            if config.database.max_connections == 0 {
                bail!("database.max_connections must be greater than 0");
            }
            println!("   ✅ Pool size: {}", config.database.max_connections);
        }
        "store" => {
            println!("💾 Entity store");
            if config.store.backend == StoreBackend::Postgres && config.database.url.is_none() {
                bail!("the postgres backend requires database.url");
            }
            println!("   ✅ Backend: {:?}", config.store.backend);
            println!(
                "   ✅ Transient retry: {} attempts",
                config.store.transient_retry.max_attempts
            );
        }
        "agents" => {
            println!("🤖 Agents");
            for (agent, settings) in config.agents.named() {
                if !settings.enabled {
                    println!("   ℹ️  {agent}: disabled");
                    continue;
                }
                if settings.batch_size == 0 || settings.concurrency == 0 {
                    bail!("agents.{agent}: batch_size and concurrency must be greater than 0");
                }
                println!(
                    "   ✅ {agent}: every {}ms, batch {}, concurrency {}",
                    settings.poll_interval_ms, settings.batch_size, settings.concurrency
                );
            }
        }
        "pull" => {
            println!("📥 Pull agents");
            if config.pull.is_empty() {
                println!("   ℹ️  No pull agents configured");
            }
            for pull in &config.pull {
                if pull.sending_pmode_id.is_empty() {
                    bail!("pull.sending_pmode_id is required");
                }
                println!(
                    "   ✅ {} every {}ms",
                    pull.sending_pmode_id, pull.poll_interval_ms
                );
            }
        }
        "body_store" => {
            println!("📦 Body store");
            if let Some(directory) = &config.body_store.directory {
                println!("   ✅ {:?} at {}", config.body_store.kind, directory.display());
            } else {
                println!("   ✅ {:?}", config.body_store.kind);
            }
        }
        "receive" => {
            println!("📨 Receive");
            match &config.receive.default_pmode_id {
                Some(id) => println!("   ✅ Default receiving policy: {id}"),
                None => println!("   ℹ️  No default receiving policy"),
            }
        }
        other => bail!("Unknown component: {other}"),
    }
    Ok(())
}

fn show(config: &RelayConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
