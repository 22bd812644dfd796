//! Repository hydration: placeholder substitution, transient file cleanup
//! and pushing the gitops and metaphor repositories to their new origin.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use provision_engine::{Ledger, Step};
use tracing::{debug, info};

use crate::config::{GitOrigin, InstallConfig};
use crate::context::InstallContext;
use crate::git::{GitRepo, PushAuth};

/// Directories never rewritten.
const SKIPPED_DIRS: [&str; 2] = [".git", ".terraform"];

/// Terraform modules whose provider caches must not be pushed.
const TERRAFORM_MODULES: [&str; 3] = ["base", "gitlab", "vault"];

/// Commit message for hydrated repositories.
const COMMIT_MESSAGE: &str = "setting new remote upstream to gitlab";

/// Rewrites placeholder tokens in a repository checkout.
pub trait Detokenize {
    /// Rewrite every file under `dir`, returning how many files changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or written.
    fn detokenize(&self, dir: &Path) -> Result<usize>;
}

/// Replaces `<NAME>` placeholders with fixed values.
#[derive(Debug, Clone, Default)]
pub struct TokenReplacer {
    tokens: BTreeMap<String, String>,
}

impl TokenReplacer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute `value` for `<name>`.
    #[must_use]
    pub fn token(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tokens.insert(format!("<{name}>"), value.into());
        self
    }

    /// Apply every substitution to `text`.
    #[must_use]
    pub fn replace(&self, text: &str) -> String {
        self.tokens
            .iter()
            .fold(text.to_string(), |acc, (token, value)| acc.replace(token, value))
    }

    fn visit(&self, dir: &Path, changed: &mut usize) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let skip = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| SKIPPED_DIRS.contains(&n));
                if !skip {
                    self.visit(&path, changed)?;
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let bytes =
                std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            // Binary files are left alone.
            let Ok(text) = String::from_utf8(bytes) else {
                continue;
            };

            let replaced = self.replace(&text);
            if replaced != text {
                std::fs::write(&path, replaced)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                debug!(path = %path.display(), "Detokenized");
                *changed += 1;
            }
        }
        Ok(())
    }
}

impl Detokenize for TokenReplacer {
    fn detokenize(&self, dir: &Path) -> Result<usize> {
        let mut changed = 0;
        self.visit(dir, &mut changed)?;
        info!(dir = %dir.display(), files = changed, "Detokenized repository");
        Ok(changed)
    }
}

/// Placeholders shared by the gitops and metaphor templates.
fn common_tokens(config: &InstallConfig, origin: GitOrigin) -> TokenReplacer {
    TokenReplacer::new()
        .token("DOMAIN_NAME", &config.domain_name)
        .token("CLUSTER_NAME", &config.cluster_name)
        .token("ALERTS_EMAIL", &config.admin_email)
        .token("GITLAB_HOST", config.host("gitlab"))
        .token("CLOUD_PROVIDER", "civo")
        .token("CLOUD_REGION", &config.region)
        .token("GIT_PROVIDER", origin.to_string())
        .token(
            "CONTAINER_REGISTRY_URL",
            format!("registry.{}/kubefirst", config.host("gitlab")),
        )
        .token(
            "METAPHOR_DEVELOPMENT_INGRESS_URL",
            format!("https://metaphor-development.{}", config.domain_name),
        )
        .token(
            "METAPHOR_STAGING_INGRESS_URL",
            format!("https://metaphor-staging.{}", config.domain_name),
        )
        .token(
            "METAPHOR_PRODUCTION_INGRESS_URL",
            format!("https://metaphor-production.{}", config.domain_name),
        )
}

/// Substitutions for the gitops template.
#[must_use]
pub fn gitops_tokens(config: &InstallConfig) -> TokenReplacer {
    common_tokens(config, config.git_origin)
        .token("GITOPS_REPO_GIT_URL", config.origin_repo_url(config.git_origin, "gitops"))
        .token("ARGOCD_INGRESS_URL", format!("https://{}", config.host("argocd")))
        .token("VAULT_INGRESS_URL", config.vault_url())
        .token("ARGO_WORKFLOWS_INGRESS_URL", format!("https://{}", config.host("argo")))
        .token("ATLANTIS_INGRESS_URL", format!("https://{}", config.host("atlantis")))
        .token("KUBECONFIG_PATH", config.kubeconfig_path().display().to_string())
}

/// Substitutions for the metaphor template.
#[must_use]
pub fn metaphor_tokens(config: &InstallConfig) -> TokenReplacer {
    common_tokens(config, GitOrigin::Gitlab)
}

/// Remove Terraform provider caches and lock files from a gitops checkout.
///
/// # Errors
///
/// Returns an error if an existing path cannot be removed.
pub fn strip_transient(dir: &Path) -> Result<()> {
    for module in TERRAFORM_MODULES {
        let module_dir = dir.join("terraform").join(module);
        let cache = module_dir.join(".terraform");
        if cache.exists() {
            std::fs::remove_dir_all(&cache)
                .with_context(|| format!("Failed to remove {}", cache.display()))?;
        }
        let lock = module_dir.join(".terraform.lock.hcl");
        if lock.exists() {
            std::fs::remove_file(&lock)
                .with_context(|| format!("Failed to remove {}", lock.display()))?;
        }
    }
    Ok(())
}

fn push_auth(origin: GitOrigin, ledger: &Ledger) -> Result<PushAuth> {
    Ok(match origin {
        GitOrigin::Gitlab => PushAuth::Basic {
            username: "root".into(),
            password: ledger.require("gitlab.token")?.to_string(),
        },
        GitOrigin::Soft => PushAuth::Ssh {
            private_key: ledger.require("botprivatekey")?.to_string(),
        },
    })
}

fn origin_requires(origin: GitOrigin) -> Vec<String> {
    match origin {
        GitOrigin::Gitlab => vec!["gitlab.token".into()],
        GitOrigin::Soft => vec!["botprivatekey".into()],
    }
}

/// Detokenize a local repository and push it to the configured origin.
pub struct PushRepoStep {
    ctx: Arc<InstallContext>,
    origin: GitOrigin,
    repo: String,
    name: String,
    checkpoint: String,
}

impl PushRepoStep {
    pub fn new(ctx: Arc<InstallContext>, origin: GitOrigin, repo: &str) -> Self {
        Self {
            ctx,
            origin,
            repo: repo.to_string(),
            name: format!("Push {repo} to {origin}"),
            checkpoint: format!("create.repos.{origin}.{repo}.pushed"),
        }
    }

    fn tokens(&self) -> TokenReplacer {
        if self.repo == "metaphor" {
            metaphor_tokens(&self.ctx.config)
        } else {
            gitops_tokens(&self.ctx.config)
        }
    }
}

#[async_trait]
impl Step for PushRepoStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    fn requires(&self) -> Vec<String> {
        origin_requires(self.origin)
    }

    fn describe(&self) -> String {
        format!(
            "detokenize {}, commit as kubefirst-bot and push to {}",
            self.ctx.config.repo_dir(&self.repo).display(),
            self.ctx.config.origin_repo_url(self.origin, &self.repo)
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let dir = self.ctx.config.repo_dir(&self.repo);
        let auth = push_auth(self.origin, ledger)?;
        let remote = self.origin.to_string();

        self.tokens().detokenize(&dir)?;
        strip_transient(&dir)?;

        let repo = GitRepo::open_or_init(&dir, self.ctx.git_bin(), self.ctx.runner.clone()).await?;
        repo.add_remote(&remote, &self.ctx.config.origin_repo_url(self.origin, &self.repo))
            .await?;
        repo.stage_all().await?;
        repo.commit(COMMIT_MESSAGE).await?;
        repo.push(&remote, &auth).await
    }
}

/// Clone the metaphor template, detokenize it and push it to GitLab.
pub struct HydrateMetaphorStep {
    ctx: Arc<InstallContext>,
    remote_url: String,
}

impl HydrateMetaphorStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        let remote_url = ctx.config.gitlab_repo_url("metaphor");
        Self { ctx, remote_url }
    }

    /// Push to `remote_url` instead of the GitLab project.
    #[must_use]
    pub fn with_remote(mut self, remote_url: impl Into<String>) -> Self {
        self.remote_url = remote_url.into();
        self
    }
}

#[async_trait]
impl Step for HydrateMetaphorStep {
    fn name(&self) -> &str {
        "Hydrate metaphor repository"
    }

    fn checkpoint(&self) -> &str {
        "create.gitlabmetaphor.pushed"
    }

    fn requires(&self) -> Vec<String> {
        vec!["gitlab.token".into()]
    }

    fn describe(&self) -> String {
        format!(
            "clone {}, detokenize, push to {}",
            self.ctx.config.metaphor_template_url, self.remote_url
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let config = &self.ctx.config;
        let dir = config.metaphor_dir();
        let auth = push_auth(GitOrigin::Gitlab, ledger)?;

        let repo = if ledger.flag("create.gitlabmetaphor.cloned") && dir.join(".git").exists() {
            info!(dir = %dir.display(), "Reusing metaphor checkout");
            GitRepo::open(&dir, self.ctx.git_bin(), self.ctx.runner.clone())
        } else {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to remove stale {}", dir.display()))?;
            }
            let repo = GitRepo::clone(
                &config.metaphor_template_url,
                &dir,
                self.ctx.git_bin(),
                self.ctx.runner.clone(),
            )
            .await?;
            // A fresh checkout still carries the template placeholders.
            ledger.remove("create.gitlabmetaphor.detokenized");
            ledger.mark_complete("create.gitlabmetaphor.cloned")?;
            repo
        };

        if !ledger.flag("create.gitlabmetaphor.detokenized") {
            metaphor_tokens(config).detokenize(&dir)?;
            ledger.mark_complete("create.gitlabmetaphor.detokenized")?;
        }

        repo.add_remote("gitlab", &self.remote_url).await?;
        repo.stage_all().await?;
        repo.commit(COMMIT_MESSAGE).await?;
        repo.push("gitlab", &auth).await
    }
}
