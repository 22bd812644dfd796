use std::path::Path;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio_util::sync::CancellationToken;

use super::ConfigArgs;
use crate::orchestrator::Installer;
use crate::ui;

/// Tear down the GitLab and base Terraform modules
#[derive(Args, Debug)]
pub struct DestroyCommand {
    #[command(flatten)]
    config: ConfigArgs,

    /// Leave the GitLab Terraform resources in place
    #[arg(long)]
    skip_gitlab_terraform: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
}

impl DestroyCommand {
    pub async fn run(&self, config_file: Option<&Path>, cancel: CancellationToken) -> Result<()> {
        let mut config = self.config.resolve(config_file)?;
        config.skip_gitlab_terraform |= self.skip_gitlab_terraform;
        config.validate()?;

        if !self.yes && !config.dry_run {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Destroy every resource of cluster '{}' under {}?",
                    config.cluster_name, config.domain_name
                ))
                .default(false)
                .interact()?;

            if !proceed {
                println!("{}", "Destroy cancelled.".yellow());
                return Ok(());
            }
        }

        let installer = Installer::new(config, cancel)?;
        let steps = installer.destroy_steps();
        installer.run("Destroy", &steps).await?;
        ui::print_success("Teardown complete");
        Ok(())
    }
}
