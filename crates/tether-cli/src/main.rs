mod config;
mod headless;
mod logging;
mod rpc;

use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use tether_core::Secret;
use tether_core::events::{EventBus, spawn_log_sink};
use tether_core::launcher::Launcher;
use tether_core::supervisor::{ProcessRole, query_version};

use config::{CliOverrides, TetherConfig};

#[derive(Parser)]
#[command(name = "tether", about = "Supervisor for a local keystore and peer-to-peer runtime")]
struct Cli {
    /// Profile name (overrides TETHER_PROFILE)
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Partition to launch (overrides TETHER_PARTITION)
    #[arg(long, global = true)]
    partition: Option<String>,

    /// Keystore binary (overrides TETHER_KEYSTORE_BIN)
    #[arg(long, global = true)]
    keystore_bin: Option<PathBuf>,

    /// Runtime binary (overrides TETHER_RUNTIME_BIN)
    #[arg(long, global = true)]
    runtime_bin: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Serve the RPC boundary for a UI
    Serve {
        /// Address to bind (overrides TETHER_BIND)
        #[arg(long)]
        bind: Option<IpAddr>,
        /// Port to listen on (overrides TETHER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Read the secret from stdin, launch, and run until Ctrl+C
    Launch,
    /// Print the version of both binaries
    Version,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let (bind, port) = match &self.command {
            Commands::Serve { bind, port } => (*bind, *port),
            _ => (None, None),
        };
        CliOverrides {
            profile: self.profile.clone(),
            partition: self.partition.clone(),
            keystore_binary: self.keystore_bin.clone(),
            runtime_binary: self.runtime_bin.clone(),
            bind,
            port,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Init { force } => {
            logging::init(None)?;
            cmd_init(&overrides, force)?;
        }
        Commands::Serve { .. } => {
            let resolved = TetherConfig::resolve(&overrides)?;
            let _log_guard = logging::init(Some(resolved.logs_dir().as_path()))?;
            cmd_serve(&resolved).await?;
        }
        Commands::Launch => {
            let resolved = TetherConfig::resolve(&overrides)?;
            let _log_guard = logging::init(Some(resolved.logs_dir().as_path()))?;
            cmd_launch(&resolved).await?;
        }
        Commands::Version => {
            logging::init(None)?;
            let resolved = TetherConfig::resolve(&overrides)?;
            cmd_version(&resolved).await?;
        }
    }

    Ok(())
}

/// Execute `tether init`: write a starter config file.
fn cmd_init(overrides: &CliOverrides, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::starter_config(
        overrides.keystore_binary.clone(),
        overrides.runtime_binary.clone(),
    );
    config::save_config_to(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("Profiles live under {}", config::data_dir().display());
    println!();
    println!("Next: run `tether serve` and point the UI at it.");

    Ok(())
}

fn build_launcher(resolved: &TetherConfig) -> Arc<Launcher> {
    tracing::info!(
        profile = %resolved.profile,
        root = %resolved.profile_root.display(),
        "using profile"
    );
    let bus = EventBus::new();
    spawn_log_sink(&bus);
    Arc::new(Launcher::new(
        resolved.launcher_config(),
        headless::collaborators(),
        bus,
    ))
}

/// First Ctrl+C cancels `cancel`; a second one exits immediately.
fn install_signal_handler(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}

async fn cmd_serve(resolved: &TetherConfig) -> anyhow::Result<()> {
    let launcher = build_launcher(resolved);
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let served = rpc::run_serve(launcher.clone(), resolved.listen, cancel).await;
    let stopped = launcher.shutdown().await;
    tracing::info!(stopped, "child processes terminated");
    served
}

async fn cmd_launch(resolved: &TetherConfig) -> anyhow::Result<()> {
    let secret = read_secret()?;
    let launcher = build_launcher(resolved);
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let launched = tokio::select! {
        result = launcher.initialize_and_launch(&secret) => result,
        _ = cancel.cancelled() => {
            launcher.shutdown().await;
            return Ok(());
        }
    };
    drop(secret);

    let runtime = match launched {
        Ok(runtime) => runtime,
        Err(e) => {
            launcher.shutdown().await;
            return Err(e).context("launch failed");
        }
    };
    println!(
        "Runtime for '{}' ready at {} (admin port {})",
        runtime.data_root.name(),
        runtime.endpoint,
        runtime.admin_port
    );

    cancel.cancelled().await;
    let stopped = launcher.shutdown().await;
    tracing::info!(stopped, "child processes terminated");
    Ok(())
}

async fn cmd_version(resolved: &TetherConfig) -> anyhow::Result<()> {
    let keystore = query_version(ProcessRole::Keystore, &resolved.keystore_binary).await?;
    println!("keystore: {keystore}");
    let runtime = query_version(ProcessRole::Runtime, &resolved.runtime_binary).await?;
    println!("runtime:  {runtime}");
    Ok(())
}

/// Read one line from stdin as the keystore secret.
fn read_secret() -> anyhow::Result<Secret> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read secret from stdin")?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        anyhow::bail!("no secret on stdin");
    }
    Ok(Secret::new(trimmed))
}
