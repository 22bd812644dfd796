use std::path::Path;

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::ConfigArgs;
use crate::orchestrator::Installer;
use crate::ui;
use crate::validator::PrerequisitesValidator;

/// Provision DNS, the cluster, GitLab, Vault and the GitOps repositories
#[derive(Args, Debug)]
pub struct CreateCommand {
    #[command(flatten)]
    config: ConfigArgs,
}

impl CreateCommand {
    pub async fn run(&self, config_file: Option<&Path>, cancel: CancellationToken) -> Result<()> {
        ui::print_banner();
        let config = self.config.resolve(config_file)?;
        config.validate()?;

        if config.dry_run {
            ui::print_info("Dry run: skipping prerequisite checks");
        } else {
            ui::print_section("Checking prerequisites");
            PrerequisitesValidator::new(&config).validate()?;
        }

        ui::print_kv("Domain", &config.domain_name);
        ui::print_kv("Cluster", &config.cluster_name);
        ui::print_kv("Region", &config.region);
        ui::print_kv("Git origin", &config.git_origin.to_string());
        ui::print_kv("Workspace", &config.workspace_dir.display().to_string());

        let installer = Installer::new(config, cancel)?;
        let steps = installer.create_steps();
        installer.run("Create", &steps).await?;
        Ok(())
    }
}
