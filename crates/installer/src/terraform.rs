//! Terraform invocation.
//!
//! Each Terraform module in the gitops repository (`base`, `gitlab`,
//! `vault`) is applied or destroyed in its own directory with an explicit
//! environment overlay; nothing is exported into the installer's own
//! environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use provision_engine::{Invocation, Ledger, ProcessError, ProcessRunner, Step};
use tracing::{debug, info};

use crate::config::InstallConfig;
use crate::context::InstallContext;

/// A Terraform module directory under `gitops/terraform/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformModule {
    /// Cluster and cloud infrastructure.
    Base,
    /// GitLab groups, projects and runners.
    Gitlab,
    /// Vault auth backends and secrets engines.
    Vault,
}

impl TerraformModule {
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Gitlab => "gitlab",
            Self::Vault => "vault",
        }
    }
}

impl std::fmt::Display for TerraformModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Environment overlay for one Terraform run.
#[derive(Debug, Clone, Default)]
pub struct TerraformEnv {
    vars: BTreeMap<String, String>,
}

impl TerraformEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider credentials and region shared by every module.
    #[must_use]
    pub fn cloud(config: &InstallConfig) -> Self {
        let mut env = Self::new()
            .set("AWS_SDK_LOAD_CONFIG", "1")
            .set("CIVO_TOKEN", &config.civo_token)
            .set("AWS_DEFAULT_REGION", &config.region)
            .var("region", &config.region)
            .var("hosted_zone_name", &config.domain_name);
        if let Some(profile) = &config.aws_profile {
            env = env.set("AWS_PROFILE", profile);
        }
        env
    }

    /// Set a plain environment variable.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set a Terraform input variable (`TF_VAR_<name>`).
    #[must_use]
    pub fn var(self, name: &str, value: impl Into<String>) -> Self {
        self.set(format!("TF_VAR_{name}"), value)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// The terraform binary plus the runner it is invoked through.
#[derive(Debug, Clone)]
pub struct Terraform {
    bin: PathBuf,
    runner: ProcessRunner,
}

impl Terraform {
    pub fn new(bin: impl Into<PathBuf>, runner: ProcessRunner) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    fn invocation(&self, dir: &Path, env: &TerraformEnv) -> Invocation {
        Invocation::new(&self.bin)
            .current_dir(dir)
            .envs(env.vars().clone())
    }

    /// `terraform init`.
    ///
    /// # Errors
    ///
    /// Returns an error if terraform cannot be started or exits non-zero.
    pub async fn init(&self, dir: &Path, env: &TerraformEnv) -> Result<(), ProcessError> {
        self.runner
            .run(&self.invocation(dir, env).arg("init"))
            .await
    }

    /// `terraform apply [-target <target>] -auto-approve`.
    ///
    /// # Errors
    ///
    /// Returns an error if terraform cannot be started or exits non-zero.
    pub async fn apply(
        &self,
        dir: &Path,
        target: Option<&str>,
        env: &TerraformEnv,
    ) -> Result<(), ProcessError> {
        let mut invocation = self.invocation(dir, env).arg("apply");
        if let Some(target) = target {
            invocation = invocation.args(["-target", target]);
        }
        self.runner.run(&invocation.arg("-auto-approve")).await
    }

    /// `terraform destroy -auto-approve`.
    ///
    /// # Errors
    ///
    /// Returns an error if terraform cannot be started or exits non-zero.
    pub async fn destroy(&self, dir: &Path, env: &TerraformEnv) -> Result<(), ProcessError> {
        self.runner
            .run(&self.invocation(dir, env).args(["destroy", "-auto-approve"]))
            .await
    }
}

/// Remove a module's provider cache so it is not committed to the gitops repo.
pub fn remove_provider_cache(dir: &Path) -> Result<()> {
    let cache = dir.join(".terraform");
    if cache.exists() {
        debug!(path = %cache.display(), "Removing terraform provider cache");
        std::fs::remove_dir_all(&cache)
            .with_context(|| format!("Failed to remove {}", cache.display()))?;
    }
    Ok(())
}

/// Build the overlay for `module` from config and earlier steps' outputs.
///
/// # Errors
///
/// Returns an error if a ledger value the module needs is missing.
pub fn module_env(module: TerraformModule, config: &InstallConfig, ledger: &Ledger) -> Result<TerraformEnv> {
    let env = TerraformEnv::cloud(config);
    let env = match module {
        TerraformModule::Base => env
            .var("cluster_name", &config.cluster_name)
            .var("email_address", &config.admin_email)
            .var("hosted_zone_id", ledger.require("dns.domain.id")?),
        TerraformModule::Gitlab => env
            .set("GITLAB_TOKEN", ledger.require("gitlab.token")?)
            .set("GITLAB_BASE_URL", &config.gitlab_local_service),
        TerraformModule::Vault => env,
    };
    Ok(env)
}

fn module_requires(module: TerraformModule) -> Vec<String> {
    match module {
        TerraformModule::Base => vec!["dns.domain.id".into()],
        TerraformModule::Gitlab => vec!["gitlab.token".into()],
        TerraformModule::Vault => Vec::new(),
    }
}

/// `terraform init` + `apply` for one module.
pub struct TerraformApplyStep {
    ctx: Arc<InstallContext>,
    module: TerraformModule,
    name: String,
    checkpoint: String,
}

impl TerraformApplyStep {
    pub fn new(ctx: Arc<InstallContext>, module: TerraformModule) -> Self {
        Self {
            ctx,
            module,
            name: format!("Apply {module} terraform"),
            checkpoint: format!("create.terraformapplied.{module}"),
        }
    }
}

#[async_trait]
impl Step for TerraformApplyStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    fn requires(&self) -> Vec<String> {
        module_requires(self.module)
    }

    fn describe(&self) -> String {
        format!(
            "terraform init && apply -auto-approve in {}",
            self.ctx.config.terraform_dir(self.module.dir_name()).display()
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let dir = self.ctx.config.terraform_dir(self.module.dir_name());
        let env = module_env(self.module, &self.ctx.config, ledger)?;
        let terraform = Terraform::new(self.ctx.config.tool("terraform"), self.ctx.runner.clone());

        info!(module = %self.module, dir = %dir.display(), "Applying terraform");
        terraform.init(&dir, &env).await?;
        terraform.apply(&dir, None, &env).await?;
        remove_provider_cache(&dir)?;
        Ok(())
    }
}

/// `terraform init` + `destroy` for one module.
pub struct TerraformDestroyStep {
    ctx: Arc<InstallContext>,
    module: TerraformModule,
    name: String,
    checkpoint: String,
}

impl TerraformDestroyStep {
    pub fn new(ctx: Arc<InstallContext>, module: TerraformModule) -> Self {
        Self {
            ctx,
            module,
            name: format!("Destroy {module} terraform"),
            checkpoint: format!("destroy.terraformdestroy.{module}"),
        }
    }
}

#[async_trait]
impl Step for TerraformDestroyStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    fn requires(&self) -> Vec<String> {
        module_requires(self.module)
    }

    fn describe(&self) -> String {
        format!(
            "terraform init && destroy -auto-approve in {}",
            self.ctx.config.terraform_dir(self.module.dir_name()).display()
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let dir = self.ctx.config.terraform_dir(self.module.dir_name());
        let env = module_env(self.module, &self.ctx.config, ledger)?;
        let terraform = Terraform::new(self.ctx.config.tool("terraform"), self.ctx.runner.clone());

        info!(module = %self.module, dir = %dir.display(), "Destroying terraform");
        terraform.init(&dir, &env).await?;
        terraform.destroy(&dir, &env).await?;
        Ok(())
    }
}
