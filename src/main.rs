//! Command-line interface for the extension host.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugin_host::config::HostConfig;
use plugin_host::{commands, logging, ExtensionManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Plugin Host - Load and manage script extensions.
#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file.
    #[arg(short, long, global = true, default_value = "plugin-host.toml")]
    config: PathBuf,

    /// Action to perform (defaults to `run`).
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load all extensions and read management commands from stdin.
    Run {
        /// Do not enable extensions after loading.
        #[arg(long)]
        no_enable: bool,
    },
    /// Validate the configuration and print the effective settings.
    CheckConfig,
    /// Compile a script or bundle into the cache without loading it.
    Compile {
        /// Script (`.rhai`) or bundle (`.rhai.zip`) to compile.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = HostConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init(&config.logging);

    match args.command.unwrap_or(Command::Run { no_enable: false }) {
        Command::Run { no_enable } => run(config, !no_enable).await,
        Command::CheckConfig => {
            let paths = &config.paths;
            println!("plugins: {}", paths.plugins_dir().display());
            println!("data:    {}", paths.data_dir().display());
            println!("lib:     {}", paths.lib_dir().display());
            println!("cache:   {}", paths.cache_dir().display());
            println!("workers: {}", config.loader.worker_count());
            println!("max operations: {}", config.loader.max_operations);
            println!("log level: {}", config.logging.level);
            Ok(())
        }
        Command::Compile { file } => {
            let manager = ExtensionManager::new(&config)?;
            let meta = manager.precompile(&file).await?;
            println!(
                "{} {} ({})",
                meta.checksum,
                meta.file.display(),
                if meta.fresh_compile { "compiled" } else { "cached" }
            );
            Ok(())
        }
    }
}

async fn run(config: HostConfig, enable: bool) -> Result<()> {
    let manager = ExtensionManager::new(&config)?;
    manager.discover_and_load_all()?;
    if enable && config.loader.auto_enable {
        manager.enable_all();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        println!("{}", commands::run_line(&manager, &line));
                    }
                }
                Ok(None) => {
                    info!("stdin closed; press Ctrl-C to stop");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Cannot read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
