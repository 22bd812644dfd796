//! Vault bootstrap: root token retrieval, the `module.bootstrap` Terraform
//! apply through a port-forward, and KV writes for later steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use provision_engine::{http_ready, Ledger, Poller, Step};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{expect_success, ApiError};
use crate::config::InstallConfig;
use crate::context::InstallContext;
use crate::terraform::{remove_provider_cache, Terraform, TerraformEnv, TerraformModule};

/// Secret holding the unseal keys and root token.
pub const UNSEAL_KEYS_SECRET: &str = "vault-unseal-keys";

/// Local end of the `svc/vault` port-forward.
pub const PORT_FORWARD_ADDR: &str = "http://localhost:8200";

/// Terraform target applied against Vault.
const BOOTSTRAP_TARGET: &str = "module.bootstrap";

/// Client for Vault's HTTP API.
#[derive(Clone)]
pub struct VaultClient {
    http: Client,
    addr: String,
    token: String,
}

impl VaultClient {
    pub fn new(http: Client, addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            addr: addr.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Write `data` at `path` (e.g. `secret/data/oidc/argo`).
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or an error status.
    pub async fn write(&self, path: &str, data: &serde_json::Value) -> Result<(), ApiError> {
        let url = format!("{}/v1/{}", self.addr, path.trim_start_matches('/'));
        debug!(url = %url, "POST request");

        let response = self
            .http
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(data)
            .send()
            .await?;

        expect_success(response).await
    }
}

#[derive(Deserialize)]
struct UnsealKeys {
    root_token: String,
}

/// Extract the root token from the `vault-unseal-keys` Secret data.
///
/// Every value is a JSON document; the last one carrying `root_token` wins.
///
/// # Errors
///
/// Returns an error if no value parses or none carries a root token.
pub fn root_token_from_secret(data: &BTreeMap<String, Vec<u8>>) -> Result<String> {
    let mut token = None;
    for (key, value) in data {
        let keys: UnsealKeys = serde_json::from_slice(value)
            .with_context(|| format!("Failed to parse {UNSEAL_KEYS_SECRET} key {key}"))?;
        token = Some(keys.root_token);
    }
    token
        .filter(|t| !t.is_empty())
        .with_context(|| format!("No root_token in secret {UNSEAL_KEYS_SECRET}"))
}

/// Environment overlay for the Vault Terraform module.
///
/// # Errors
///
/// Returns an error if a ledger value the module needs is missing.
pub fn vault_env(config: &InstallConfig, ledger: &Ledger, vault_token: &str) -> Result<TerraformEnv> {
    let mut env = TerraformEnv::cloud(config)
        .set("VAULT_ADDR", PORT_FORWARD_ADDR)
        .set("VAULT_TOKEN", vault_token)
        .var("vault_addr", config.vault_url())
        .var("vault_token", vault_token)
        .var("gitlab_runner_token", ledger.require("gitlab.runnertoken")?)
        .var("gitlab_token", ledger.require("gitlab.token")?)
        .var("email_address", &config.admin_email)
        .var("vault_redirect_uris", r#"["will-be-patched-later"]"#);

    if let Some(zone_id) = ledger.text("dns.domain.id") {
        env = env.var("hosted_zone_id", zone_id);
    }
    Ok(env)
}

/// Read the root token and apply the Vault bootstrap module.
pub struct ConfigureVaultStep {
    ctx: Arc<InstallContext>,
}

impl ConfigureVaultStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }

    async fn apply_bootstrap(&self, env: &TerraformEnv) -> Result<()> {
        let dir = self
            .ctx
            .config
            .terraform_dir(TerraformModule::Vault.dir_name());
        let terraform = Terraform::new(self.ctx.config.tool("terraform"), self.ctx.runner.clone());

        info!(dir = %dir.display(), target = BOOTSTRAP_TARGET, "Applying vault terraform");
        terraform.init(&dir, env).await?;
        terraform.apply(&dir, Some(BOOTSTRAP_TARGET), env).await?;
        remove_provider_cache(&dir)
    }
}

#[async_trait]
impl Step for ConfigureVaultStep {
    fn name(&self) -> &str {
        "Configure Vault"
    }

    fn checkpoint(&self) -> &str {
        "create.terraformapplied.vault"
    }

    fn requires(&self) -> Vec<String> {
        vec!["gitlab.token".into(), "gitlab.runnertoken".into()]
    }

    fn describe(&self) -> String {
        format!(
            "read the vault root token, port-forward svc/vault 8200:8200, terraform apply -target {BOOTSTRAP_TARGET}"
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let kube = self.ctx.kube().await?;
        let data = kube.secret_data("vault", UNSEAL_KEYS_SECRET).await?;
        let vault_token = root_token_from_secret(&data)?;
        ledger.set_and_persist("vault.token", vault_token.as_str())?;

        let env = vault_env(&self.ctx.config, ledger, &vault_token)?;

        let port_forward = self.ctx.runner.spawn(
            &self
                .ctx
                .kubectl("vault")
                .args(["port-forward", "svc/vault", "8200:8200"]),
        )?;

        let health = format!("{PORT_FORWARD_ADDR}/v1/sys/health");
        let forwarded = self
            .ctx
            .poller(Poller::new(Duration::from_secs(1), 30))
            .is_ready("vault port-forward", || http_ready(&self.ctx.http, &health))
            .await;
        if !forwarded {
            warn!("Vault did not answer through the port-forward, applying anyway");
        }

        let result = self.apply_bootstrap(&env).await;
        port_forward.stop().await;
        result
    }
}
