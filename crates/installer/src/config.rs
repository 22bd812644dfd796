//! Installation configuration types.
//!
//! Defaults are rooted at `~/.kubefirst`. A YAML file can override any
//! field, and CLI flags override the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the hidden workspace directory under the home directory.
pub const WORKSPACE_DIR_NAME: &str = ".kubefirst";

/// Git server the rendered repositories are pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GitOrigin {
    /// The GitLab instance the installer provisions (HTTPS basic auth).
    #[default]
    Gitlab,
    /// In-cluster soft-serve (SSH with the bot key).
    Soft,
}

impl std::fmt::Display for GitOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gitlab => write!(f, "gitlab"),
            Self::Soft => write!(f, "soft"),
        }
    }
}

impl std::str::FromStr for GitOrigin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gitlab" => Ok(Self::Gitlab),
            "soft" => Ok(Self::Soft),
            _ => Err(anyhow::anyhow!(
                "Unknown git origin: {s}. Supported: gitlab, soft"
            )),
        }
    }
}

/// Full installation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    // Cluster identity
    /// Name of the cluster being provisioned.
    pub cluster_name: String,
    /// Hosted zone every public hostname lives under (e.g. "example.com").
    pub domain_name: String,
    /// Cloud region for DNS and Terraform (e.g. "LON1").
    pub region: String,
    /// Email address for certificate registration and alerts.
    pub admin_email: String,

    // Credentials
    /// Civo API token. Usually supplied through `CIVO_TOKEN`.
    #[serde(skip_serializing)]
    pub civo_token: String,
    /// Shared-credentials profile selected for Terraform's AWS provider.
    pub aws_profile: Option<String>,

    // Behaviour
    /// Log every step's intent without executing anything.
    pub dry_run: bool,
    /// Skip the DNS TXT propagation check.
    pub skip_domain_check: bool,
    /// Skip `terraform destroy` of the GitLab module on teardown.
    pub skip_gitlab_terraform: bool,
    /// Where the gitops repository is pushed.
    pub git_origin: GitOrigin,

    // Paths
    /// Workspace holding the ledger, rendered repositories and tools.
    pub workspace_dir: PathBuf,
    /// Directory of pinned tool binaries; names fall back to `PATH`.
    pub tools_dir: PathBuf,

    // Endpoints
    /// Civo API base URL.
    pub civo_api_url: String,
    /// GitLab reachable from this machine (port-forwarded webservice).
    pub gitlab_local_service: String,
    /// soft-serve SSH endpoint used when `git_origin` is `soft`.
    pub soft_serve_url: String,
    /// Template cloned to seed the metaphor application repository.
    pub metaphor_template_url: String,
    /// Prefix of the TXT record written by the DNS liveness check.
    pub liveness_record_prefix: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        let workspace_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(WORKSPACE_DIR_NAME);
        Self {
            cluster_name: "kubefirst".into(),
            domain_name: String::new(),
            region: "LON1".into(),
            admin_email: String::new(),
            civo_token: String::new(),
            aws_profile: None,
            dry_run: false,
            skip_domain_check: false,
            skip_gitlab_terraform: false,
            git_origin: GitOrigin::default(),
            tools_dir: workspace_dir.join("tools"),
            workspace_dir,
            civo_api_url: "https://api.civo.com/v2".into(),
            gitlab_local_service: "http://localhost:8888".into(),
            soft_serve_url: "ssh://127.0.0.1:8022".into(),
            metaphor_template_url: "https://github.com/kubefirst/metaphor-template".into(),
            liveness_record_prefix: "kubefirst-liveness".into(),
        }
    }
}

impl InstallConfig {
    /// Create config with defaults for a given domain.
    #[must_use]
    pub fn with_defaults(domain_name: impl Into<String>) -> Self {
        Self {
            domain_name: domain_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Re-root every derived path under `dir`.
    #[must_use]
    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.tools_dir = dir.join("tools");
        self.workspace_dir = dir;
        self
    }

    /// Check the fields every real run needs.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.domain_name.trim().is_empty() {
            anyhow::bail!("domain name is required (--domain-name or domain_name in the config file)");
        }
        if !self.dry_run && self.civo_token.trim().is_empty() {
            anyhow::bail!("a Civo API token is required (CIVO_TOKEN)");
        }
        Ok(())
    }

    /// Get the checkpoint ledger path.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.workspace_dir.join("state.json")
    }

    /// Get the kubeconfig path written by the base Terraform module.
    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.workspace_dir.join("kubeconfig")
    }

    #[must_use]
    pub fn gitops_dir(&self) -> PathBuf {
        self.workspace_dir.join("gitops")
    }

    #[must_use]
    pub fn metaphor_dir(&self) -> PathBuf {
        self.workspace_dir.join("metaphor")
    }

    /// Local checkout of the repository named `repo`.
    #[must_use]
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.workspace_dir.join(repo)
    }

    /// Terraform module directory inside the gitops repository.
    #[must_use]
    pub fn terraform_dir(&self, module: &str) -> PathBuf {
        self.gitops_dir().join("terraform").join(module)
    }

    /// Resolve a tool binary: pinned copy in `tools_dir`, else the bare name.
    #[must_use]
    pub fn tool(&self, name: &str) -> PathBuf {
        let pinned = self.tools_dir.join(name);
        if pinned.is_file() {
            pinned
        } else {
            PathBuf::from(name)
        }
    }

    /// Public hostname of a platform service, e.g. `gitlab.example.com`.
    #[must_use]
    pub fn host(&self, service: &str) -> String {
        format!("{service}.{}", self.domain_name)
    }

    #[must_use]
    pub fn gitlab_url(&self) -> String {
        format!("https://{}", self.host("gitlab"))
    }

    #[must_use]
    pub fn vault_url(&self) -> String {
        format!("https://{}", self.host("vault"))
    }

    /// HTTPS clone URL of a repository in the GitLab `kubefirst` group.
    #[must_use]
    pub fn gitlab_repo_url(&self, repo: &str) -> String {
        format!("{}/kubefirst/{repo}.git", self.gitlab_url())
    }

    /// Remote URL for `repo` on the configured origin.
    #[must_use]
    pub fn origin_repo_url(&self, origin: GitOrigin, repo: &str) -> String {
        match origin {
            GitOrigin::Gitlab => self.gitlab_repo_url(repo),
            GitOrigin::Soft => format!("{}/{repo}", self.soft_serve_url.trim_end_matches('/')),
        }
    }
}
