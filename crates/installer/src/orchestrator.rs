//! Installer orchestration module.
//!
//! Declares the create and destroy sequences and runs them through the
//! step executor against the workspace's checkpoint ledger. The order of
//! the lists is the data-dependency contract between steps.

use std::sync::Arc;

use anyhow::{Context, Result};
use provision_engine::{Executor, Ledger, RunReport, Step};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::InstallConfig;
use crate::context::InstallContext;
use crate::dns::{DnsLivenessStep, DnsZoneStep};
use crate::gitlab::{
    AwaitGitLabStep, BotKeysStep, GitLabKeyUploadStep, GitLabOidcStep, GitLabRegistryStep,
    GitLabTokensStep,
};
use crate::gitops::{HydrateMetaphorStep, PushRepoStep};
use crate::terraform::{TerraformApplyStep, TerraformDestroyStep, TerraformModule};
use crate::ui;
use crate::vault::ConfigureVaultStep;

/// Builds and runs the provisioning sequences.
pub struct Installer {
    ctx: Arc<InstallContext>,
}

impl Installer {
    /// # Errors
    ///
    /// Returns an error if the shared clients cannot be created.
    pub fn new(config: InstallConfig, cancel: CancellationToken) -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(InstallContext::new(config, cancel)?),
        })
    }

    #[must_use]
    pub fn config(&self) -> &InstallConfig {
        &self.ctx.config
    }

    /// The full create sequence, in dependency order.
    #[must_use]
    pub fn create_steps(&self) -> Vec<Box<dyn Step>> {
        let ctx = &self.ctx;
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(DnsZoneStep::new(Arc::clone(ctx)))];

        if !ctx.config.skip_domain_check {
            steps.push(Box::new(DnsLivenessStep::new(Arc::clone(ctx))));
        }

        steps.extend([
            Box::new(BotKeysStep::new(Arc::clone(ctx))) as Box<dyn Step>,
            Box::new(TerraformApplyStep::new(Arc::clone(ctx), TerraformModule::Base)),
            Box::new(AwaitGitLabStep::new(ctx)),
            Box::new(GitLabTokensStep::new(Arc::clone(ctx))),
            Box::new(TerraformApplyStep::new(Arc::clone(ctx), TerraformModule::Gitlab)),
            Box::new(GitLabKeyUploadStep::new(ctx)),
            Box::new(PushRepoStep::new(Arc::clone(ctx), ctx.config.git_origin, "gitops")),
            Box::new(GitLabRegistryStep::new(Arc::clone(ctx))),
            Box::new(ConfigureVaultStep::new(Arc::clone(ctx))),
            Box::new(GitLabOidcStep::new(ctx)),
            Box::new(HydrateMetaphorStep::new(Arc::clone(ctx))),
        ]);
        steps
    }

    /// The teardown sequence: GitLab resources first, then the base cluster.
    #[must_use]
    pub fn destroy_steps(&self) -> Vec<Box<dyn Step>> {
        let ctx = &self.ctx;
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        if !ctx.config.skip_gitlab_terraform {
            steps.push(Box::new(TerraformDestroyStep::new(
                Arc::clone(ctx),
                TerraformModule::Gitlab,
            )));
        }
        steps.push(Box::new(TerraformDestroyStep::new(
            Arc::clone(ctx),
            TerraformModule::Base,
        )));
        steps
    }

    /// Load the workspace ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger file exists but cannot be read.
    pub fn ledger(&self) -> Result<Ledger> {
        let path = self.ctx.config.state_file();
        Ledger::load(&path).with_context(|| format!("Failed to load state from {}", path.display()))
    }

    /// Run `steps` against the workspace ledger and report the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first failure; every checkpoint completed before it stays
    /// recorded so the same command resumes after it.
    pub async fn run(&self, title: &str, steps: &[Box<dyn Step>]) -> Result<RunReport> {
        let mut ledger = self.ledger()?;
        self.print_plan(title, steps, &ledger);

        let executor = Executor::new()
            .dry_run(self.ctx.config.dry_run)
            .with_cancellation(self.ctx.cancel.clone());

        match executor.run(steps, &mut ledger).await {
            Ok(report) => {
                info!(
                    completed = report.completed(),
                    skipped = report.skipped(),
                    "Run finished"
                );
                self.print_summary(title, &report);
                Ok(report)
            }
            Err(e) => {
                error!(step = %e.step(), error = %e, "Run failed");
                ui::print_error(&format!("{title} failed at step '{}'", e.step()));
                ui::print_error(&e.to_string());
                ui::print_info(&format!(
                    "Progress is saved in {}. Re-run the same command to resume.",
                    self.ctx.config.state_file().display()
                ));
                Err(e.into())
            }
        }
    }

    fn print_plan(&self, title: &str, steps: &[Box<dyn Step>], ledger: &Ledger) {
        ui::print_section(title);
        if self.ctx.config.dry_run {
            ui::print_warning("Dry run: nothing will be changed");
        }
        for (i, step) in steps.iter().enumerate() {
            let label = if ledger.flag(step.checkpoint()) {
                format!("{} (done)", step.name())
            } else {
                step.name().to_string()
            };
            ui::print_progress_step(i + 1, steps.len(), &label);
        }
        println!();
    }

    fn print_summary(&self, title: &str, report: &RunReport) {
        ui::print_section(&format!("{title} complete"));
        for (name, state) in &report.steps {
            ui::print_kv(name, &state.to_string());
        }
        println!();

        if self.ctx.config.dry_run {
            ui::print_info(&format!("{} steps would run", report.dry_run()));
            return;
        }

        ui::print_success(&format!(
            "{} steps completed, {} already done",
            report.completed(),
            report.skipped()
        ));
        ui::print_info(&format!("GitLab: {}", self.ctx.config.gitlab_url()));
        ui::print_info(&format!("Vault: {}", self.ctx.config.vault_url()));
        ui::print_info(&format!(
            "ArgoCD: https://{}",
            self.ctx.config.host("argocd")
        ));
    }
}
