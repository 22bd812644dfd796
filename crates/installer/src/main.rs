//! GitOps Platform Installer CLI.
//!
//! Provisions DNS, a Civo cluster, GitLab, Vault and the GitOps
//! repositories. Every command is resumable: re-running it skips the
//! steps already recorded in the workspace state file.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gitops_installer::commands::create::CreateCommand;
use gitops_installer::commands::destroy::DestroyCommand;
use gitops_installer::commands::status::StatusCommand;

/// GitOps Platform Installer.
#[derive(Parser)]
#[command(
    name = "gitops-installer",
    version,
    about = "Resumable GitOps platform installer",
    long_about = "Provision a GitOps platform: DNS zone checks, the cluster via Terraform,\n\
                  GitLab, Vault, ArgoCD repository wiring and application templates.\n\n\
                  All operations are checkpointed - re-running the same command will\n\
                  resume from where it left off."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML configuration file.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the platform.
    Create(CreateCommand),

    /// Tear down the Terraform-managed infrastructure.
    Destroy(DestroyCommand),

    /// Show recorded checkpoints and values.
    Status(StatusCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("info,provision_engine=debug,gitops_installer=debug")
    } else {
        EnvFilter::new("warn,provision_engine=info,gitops_installer=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current operation");
            on_interrupt.cancel();
        }
    });

    let config_file = cli.config.as_deref();
    match cli.command {
        Commands::Create(cmd) => cmd.run(config_file, cancel).await,
        Commands::Destroy(cmd) => cmd.run(config_file, cancel).await,
        Commands::Status(cmd) => cmd.run(config_file),
    }
}
