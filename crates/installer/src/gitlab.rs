//! GitLab bring-up: bot keys, readiness, credentials, key upload, ArgoCD
//! repository switch-over and OIDC application registration.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use provision_engine::poller::DEFAULT_INTERVAL;
use provision_engine::{http_ready, Invocation, Ledger, Poller, Step};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{handle_response, ApiError};
use crate::config::InstallConfig;
use crate::context::InstallContext;
use crate::k8s::{opaque_secret, CreateOutcome};
use crate::vault::VaultClient;

/// Applications registered as OIDC clients.
pub const OIDC_APPS: [&str; 3] = ["argo", "argocd", "vault"];

/// Scopes granted to every OIDC application.
pub const OIDC_SCOPES: &str = "read_user openid email";

/// Title of the bot's SSH key in GitLab.
const BOT_KEY_TITLE: &str = "kubefirst";

/// Attempts while waiting for the toolbox pod to be scheduled.
const TOOLBOX_POD_ATTEMPTS: u32 = 60;

/// Attempts for the SSH key upload right after GitLab comes up.
const KEY_UPLOAD_ATTEMPTS: u32 = 30;

/// An OAuth application as returned by the GitLab API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabApplication {
    pub id: u64,
    pub application_id: String,
    pub application_name: String,
    /// Only present in the create response.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub callback_url: String,
}

/// GitLab REST API client authenticated with a personal access token.
#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GitLabClient {
    pub fn new(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v4{path}", self.base_url)
    }

    /// Add an SSH key to the token owner's account.
    ///
    /// The response body is decoded best-effort and only logged. A key that
    /// is already registered counts as uploaded.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or an error status.
    pub async fn upload_ssh_key(&self, title: &str, key: &str) -> Result<(), ApiError> {
        let url = self.url("/user/keys");
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .query(&[("private_token", self.token.as_str())])
            .form(&[("title", title), ("key", key)])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) => debug!(status = status.as_u16(), body = %body, "Key upload response"),
            Err(e) => warn!(status = status.as_u16(), error = %e, "Key upload response is not JSON"),
        }

        if status.is_success() {
            Ok(())
        } else if status == StatusCode::BAD_REQUEST && text.contains("has already been taken") {
            info!("SSH key already registered");
            Ok(())
        } else {
            Err(ApiError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Register an OAuth application.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or an error status.
    pub async fn create_application(
        &self,
        name: &str,
        redirect_uri: &str,
        scopes: &str,
    ) -> Result<GitLabApplication, ApiError> {
        let url = self.url("/applications");
        debug!(url = %url, name = %name, "POST request");

        let response = self
            .client
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .form(&[
                ("name", name),
                ("redirect_uri", redirect_uri),
                ("scopes", scopes),
            ])
            .send()
            .await?;

        handle_response(response).await
    }

    /// List registered OAuth applications.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or an error status.
    pub async fn list_applications(&self) -> Result<Vec<GitLabApplication>, ApiError> {
        let url = self.url("/applications");
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        handle_response(response).await
    }
}

/// Redirect URIs registered for an OIDC application, space separated.
#[must_use]
pub fn oidc_callback(app: &str, domain: &str) -> String {
    match app {
        "argo" => format!("https://argo.{domain}/oauth2/callback"),
        "argocd" => format!("https://argocd.{domain}/auth/callback"),
        "vault" => format!(
            "https://vault.{domain}:8250/oidc/callback \
             http://localhost:8250/oidc/callback \
             https://vault.{domain}/ui/vault/auth/oidc/oidc/callback \
             http://localhost:8200/ui/vault/auth/oidc/oidc/callback"
        ),
        other => format!("https://{other}.{domain}/oauth2/callback"),
    }
}

/// Rails snippet that creates a root personal access token with a known value.
#[must_use]
pub fn personal_access_token_script(token: &str) -> String {
    format!(
        "token = User.find_by_username('root').personal_access_tokens.create(\
         scopes: [:write_registry, :write_repository, :api], name: 'Automation token'); \
         token.set_token('{token}'); token.save!"
    )
}

/// A fresh 20-character personal access token.
#[must_use]
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()[..20].to_string()
}

/// ArgoCD repository-credential and repository Secrets pointing at GitLab.
#[must_use]
pub fn argocd_repo_secrets(config: &InstallConfig, token: &str) -> [Secret; 2] {
    let group_url = format!("{}/kubefirst/", config.gitlab_url());
    let gitops_url = config.gitlab_repo_url("gitops");
    let annotations = [("managed-by", "argocd.argoproj.io")];

    [
        opaque_secret(
            "argocd",
            "creds-gitlab",
            &[("argocd.argoproj.io/secret-type", "repo-creds")],
            &annotations,
            &[
                ("password", token),
                ("url", &group_url),
                ("username", "root"),
            ],
        ),
        opaque_secret(
            "argocd",
            "repo-gitlab",
            &[("argocd.argoproj.io/secret-type", "repository")],
            &annotations,
            &[("project", "default"), ("type", "git"), ("url", &gitops_url)],
        ),
    ]
}

// =============================================================================
// Steps
// =============================================================================

/// Generate the bot's RSA key pair.
pub struct BotKeysStep {
    ctx: Arc<InstallContext>,
}

impl BotKeysStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for BotKeysStep {
    fn name(&self) -> &str {
        "Generate bot SSH keys"
    }

    fn checkpoint(&self) -> &str {
        "create.botkeys"
    }

    fn describe(&self) -> String {
        "generate a 2048-bit RSA key pair for kubefirst-bot with ssh-keygen".into()
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let scratch = tempfile::TempDir::new().context("Failed to create scratch directory")?;
        let key_path = scratch.path().join("id_rsa");

        let invocation = Invocation::new(self.ctx.config.tool("ssh-keygen"))
            .args(["-q", "-t", "rsa", "-b", "2048", "-m", "PEM", "-N", ""])
            .args(["-C", "kubefirst-bot", "-f"])
            .arg(&key_path);
        self.ctx.runner.run(&invocation).await?;

        let private_key = std::fs::read_to_string(&key_path).context("Failed to read private key")?;
        let public_key = std::fs::read_to_string(key_path.with_extension("pub"))
            .context("Failed to read public key")?;

        ledger.set_and_persist("botprivatekey", private_key)?;
        ledger.set_and_persist("botpublickey", public_key.trim())?;
        Ok(())
    }
}

/// Wait until GitLab's public endpoint answers 200.
pub struct AwaitGitLabStep {
    url: String,
    http: Client,
    poller: Poller,
}

impl AwaitGitLabStep {
    pub fn new(ctx: &InstallContext) -> Self {
        Self::with_target(ctx.config.gitlab_url(), ctx.http.clone(), ctx.poller(Poller::http()))
    }

    pub fn with_target(url: impl Into<String>, http: Client, poller: Poller) -> Self {
        Self {
            url: url.into(),
            http,
            poller,
        }
    }
}

#[async_trait]
impl Step for AwaitGitLabStep {
    fn name(&self) -> &str {
        "Wait for GitLab"
    }

    fn checkpoint(&self) -> &str {
        "create.gitlab.ready"
    }

    fn describe(&self) -> String {
        format!("poll {} until it answers 200", self.url)
    }

    async fn run(&self, _ledger: &mut Ledger) -> Result<()> {
        self.poller
            .poll(&self.url, || http_ready(&self.http, &self.url))
            .await?;
        Ok(())
    }
}

/// Harvest generated credentials and mint the automation token.
pub struct GitLabTokensStep {
    ctx: Arc<InstallContext>,
}

impl GitLabTokensStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for GitLabTokensStep {
    fn name(&self) -> &str {
        "Produce GitLab tokens"
    }

    fn checkpoint(&self) -> &str {
        "create.gitlab.tokens"
    }

    fn describe(&self) -> String {
        "read ArgoCD and GitLab root passwords, create a root personal access token, read the runner token".into()
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let kube = self.ctx.kube().await?;

        let argocd_password = kube
            .secret_value("argocd", "argocd-initial-admin-secret", "password")
            .await?;
        ledger.set_and_persist("argocd.admin.password", argocd_password)?;

        let found = OnceLock::new();
        let (kube_ref, found_ref) = (&kube, &found);
        self.ctx
            .poller(Poller::new(DEFAULT_INTERVAL, TOOLBOX_POD_ATTEMPTS))
            .poll("gitlab toolbox pod", move || async move {
                match kube_ref.pod_name_by_label("gitlab", "app=toolbox").await? {
                    Some(name) => {
                        let _ = found_ref.set(name);
                        Ok::<_, anyhow::Error>(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;
        let pod_name = found.get().cloned().context("Toolbox pod name not recorded")?;
        info!(pod = %pod_name, "Found gitlab toolbox pod");

        let secret_names = kube.secret_names("gitlab").await?;
        let root_secret = secret_names
            .iter()
            .find(|name| name.contains("initial-root-password"))
            .context("No gitlab initial root password secret found")?;
        let root_password = kube.secret_value("gitlab", root_secret, "password").await?;

        ledger.set_and_persist("gitlab.podname", pod_name.as_str())?;
        ledger.set_and_persist("gitlab.root.password", root_password)?;

        if ledger.contains("gitlab.token") {
            info!("Personal access token already present");
        } else {
            let token = generate_token();
            let invocation = self
                .ctx
                .kubectl("gitlab")
                .args(["exec", pod_name.as_str(), "--", "gitlab-rails", "runner"])
                .secret_arg(personal_access_token_script(&token));
            self.ctx
                .runner
                .run(&invocation)
                .await
                .with_context(|| format!("Failed to create personal access token on {pod_name}"))?;
            ledger.set_and_persist("gitlab.token", token)?;
        }

        if !ledger.contains("gitlab.runnertoken") {
            let runner_token = kube
                .secret_value("gitlab", "gitlab-gitlab-runner-secret", "runner-registration-token")
                .await?;
            ledger.set_and_persist("gitlab.runnertoken", runner_token)?;
        }
        Ok(())
    }
}

/// Register the bot's public key with the root account.
pub struct GitLabKeyUploadStep {
    base_url: String,
    http: Client,
    poller: Poller,
}

impl GitLabKeyUploadStep {
    pub fn new(ctx: &InstallContext) -> Self {
        Self::with_target(
            ctx.config.gitlab_local_service.clone(),
            ctx.http.clone(),
            ctx.poller(Poller::new(DEFAULT_INTERVAL, KEY_UPLOAD_ATTEMPTS)),
        )
    }

    pub fn with_target(base_url: impl Into<String>, http: Client, poller: Poller) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            poller,
        }
    }
}

#[async_trait]
impl Step for GitLabKeyUploadStep {
    fn name(&self) -> &str {
        "Upload bot SSH key to GitLab"
    }

    fn checkpoint(&self) -> &str {
        "gitlab.keyuploaded"
    }

    fn requires(&self) -> Vec<String> {
        vec!["gitlab.token".into(), "botpublickey".into()]
    }

    fn describe(&self) -> String {
        format!("POST the bot public key to {}/api/v4/user/keys", self.base_url)
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let client = GitLabClient::new(
            self.http.clone(),
            &self.base_url,
            ledger.require("gitlab.token")?,
        );
        let key = ledger.require("botpublickey")?;

        // Set when GitLab refuses the key outright; polling stops there.
        let rejected = OnceLock::new();
        let (client, rejected_ref) = (&client, &rejected);
        self.poller
            .poll("gitlab ssh key upload", move || async move {
                match client.upload_ssh_key(BOT_KEY_TITLE, key).await {
                    Ok(()) => Ok::<_, anyhow::Error>(true),
                    Err(e) if e.is_transient() => Err(e.into()),
                    Err(e) => {
                        let _ = rejected_ref.set(e);
                        Ok(true)
                    }
                }
            })
            .await?;

        match rejected.into_inner() {
            Some(e) => Err(anyhow::Error::new(e).context("GitLab rejected the bot SSH key")),
            None => Ok(()),
        }
    }
}

/// Point ArgoCD at the GitLab-hosted gitops repository.
pub struct GitLabRegistryStep {
    ctx: Arc<InstallContext>,
}

impl GitLabRegistryStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for GitLabRegistryStep {
    fn name(&self) -> &str {
        "Switch ArgoCD to GitLab"
    }

    fn checkpoint(&self) -> &str {
        "gitlab.registry"
    }

    fn requires(&self) -> Vec<String> {
        vec!["gitlab.token".into()]
    }

    fn describe(&self) -> String {
        "create ArgoCD repository secrets for GitLab and apply argocd-adopts-gitlab.yaml".into()
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let kube = self.ctx.kube().await?;
        for secret in argocd_repo_secrets(&self.ctx.config, ledger.require("gitlab.token")?) {
            if kube.create_secret(&secret).await? == CreateOutcome::AlreadyExists {
                debug!(name = ?secret.metadata.name, "Keeping existing secret");
            }
        }

        let manifest = self
            .ctx
            .config
            .gitops_dir()
            .join("components/gitlab/argocd-adopts-gitlab.yaml");
        let invocation = self.ctx.kubectl("argocd").arg("apply").arg("-f").arg(&manifest);
        self.ctx.runner.run(&invocation).await?;
        Ok(())
    }
}

/// Register OIDC clients for Argo Workflows, ArgoCD and Vault, and store
/// their credentials in Vault.
pub struct GitLabOidcStep {
    gitlab_base: String,
    vault_addr: String,
    domain: String,
    http: Client,
}

impl GitLabOidcStep {
    pub fn new(ctx: &InstallContext) -> Self {
        Self::with_targets(
            ctx.config.gitlab_local_service.clone(),
            ctx.config.vault_url(),
            ctx.config.domain_name.clone(),
            ctx.http.clone(),
        )
    }

    pub fn with_targets(
        gitlab_base: impl Into<String>,
        vault_addr: impl Into<String>,
        domain: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            gitlab_base: gitlab_base.into(),
            vault_addr: vault_addr.into(),
            domain: domain.into(),
            http,
        }
    }
}

#[async_trait]
impl Step for GitLabOidcStep {
    fn name(&self) -> &str {
        "Register GitLab OIDC applications"
    }

    fn checkpoint(&self) -> &str {
        "create.gitlab.oidc"
    }

    fn requires(&self) -> Vec<String> {
        vec!["gitlab.token".into(), "vault.token".into()]
    }

    fn describe(&self) -> String {
        format!(
            "create GitLab OIDC applications {} and write their credentials to vault",
            OIDC_APPS.join(", ")
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let gitlab = GitLabClient::new(
            self.http.clone(),
            &self.gitlab_base,
            ledger.require("gitlab.token")?,
        );
        let vault = VaultClient::new(
            self.http.clone(),
            &self.vault_addr,
            ledger.require("vault.token")?,
        );

        for app in OIDC_APPS {
            let id_key = format!("gitlab.oidc.{app}.applicationid");
            let secret_key = format!("gitlab.oidc.{app}.secret");
            let stored_key = format!("gitlab.oidc.{app}.stored");

            if ledger.flag(&stored_key) {
                debug!(app = %app, "OIDC application already registered");
                continue;
            }

            if !ledger.contains(&id_key) {
                info!(app = %app, "Creating gitlab oidc application");
                let created = gitlab
                    .create_application(app, &oidc_callback(app, &self.domain), OIDC_SCOPES)
                    .await
                    .with_context(|| format!("Failed to create oidc application {app}"))?;

                let listed = gitlab.list_applications().await?;
                if !listed.iter().any(|a| a.application_name == app) {
                    anyhow::bail!("could not create gitlab oidc application {app}");
                }

                let secret = created
                    .secret
                    .with_context(|| format!("GitLab returned no secret for {app}"))?;
                ledger.set_and_persist(id_key.as_str(), created.application_id)?;
                ledger.set_and_persist(secret_key.as_str(), secret)?;
            }

            let data = serde_json::json!({
                "data": {
                    "application_id": ledger.require(&id_key)?,
                    "secret": ledger.require(&secret_key)?,
                }
            });
            vault
                .write(&format!("secret/data/oidc/{app}"), &data)
                .await
                .with_context(|| format!("Failed to store oidc credentials for {app}"))?;
            ledger.mark_complete(&stored_key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_INTERVAL: Duration = Duration::from_millis(10);

    #[test]
    fn test_oidc_callbacks() {
        assert_eq!(
            oidc_callback("argo", "example.com"),
            "https://argo.example.com/oauth2/callback"
        );
        assert_eq!(
            oidc_callback("argocd", "example.com"),
            "https://argocd.example.com/auth/callback"
        );
        let vault = oidc_callback("vault", "example.com");
        assert_eq!(vault.split(' ').count(), 4);
        assert!(vault.starts_with("https://vault.example.com:8250/oidc/callback "));
    }

    #[test]
    fn test_generated_token_length() {
        let token = generate_token();
        assert_eq!(token.len(), 20);
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_personal_access_token_script() {
        let script = personal_access_token_script("abc");
        assert!(script.contains("User.find_by_username('root')"));
        assert!(script.contains("token.set_token('abc')"));
        assert!(script.ends_with("token.save!"));
    }

    #[test]
    fn test_argocd_repo_secrets() {
        let config = InstallConfig::with_defaults("example.com");
        let [creds, repo] = argocd_repo_secrets(&config, "glpat-1");

        assert_eq!(creds.metadata.name.as_deref(), Some("creds-gitlab"));
        let data = creds.data.unwrap();
        assert_eq!(data["password"].0, b"glpat-1".to_vec());
        assert_eq!(data["username"].0, b"root".to_vec());
        assert_eq!(
            data["url"].0,
            b"https://gitlab.example.com/kubefirst/".to_vec()
        );

        let labels = repo.metadata.labels.unwrap();
        assert_eq!(labels["argocd.argoproj.io/secret-type"], "repository");
        assert_eq!(
            repo.data.unwrap()["url"].0,
            b"https://gitlab.example.com/kubefirst/gitops.git".to_vec()
        );
    }

    #[tokio::test]
    async fn test_await_gitlab_after_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(5)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        let grace = Duration::from_millis(100);
        let step = AwaitGitLabStep::with_target(
            server.uri(),
            Client::new(),
            Poller::new(TEST_INTERVAL, 200).with_grace(grace),
        );

        let started = std::time::Instant::now();
        let mut ledger = Ledger::in_memory();
        step.run(&mut ledger).await.unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 6);
        assert!(started.elapsed() >= grace);
    }

    #[tokio::test]
    async fn test_key_upload_retries_until_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/user/keys"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v4/user/keys"))
            .and(query_param("private_token", "glpat-1"))
            .and(body_string_contains("title=kubefirst"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 1})))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let step = GitLabKeyUploadStep::with_target(
            server.uri(),
            Client::new(),
            Poller::new(TEST_INTERVAL, 5),
        );
        let mut ledger = Ledger::in_memory();
        ledger.set("gitlab.token", "glpat-1");
        ledger.set("botpublickey", "ssh-rsa AAAA kubefirst-bot");

        step.run(&mut ledger).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_key_upload_unauthorized_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/user/keys"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "message": "401 Unauthorized"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let step = GitLabKeyUploadStep::with_target(
            server.uri(),
            Client::new(),
            Poller::new(TEST_INTERVAL, 5),
        );
        let mut ledger = Ledger::in_memory();
        ledger.set("gitlab.token", "glpat-revoked");
        ledger.set("botpublickey", "ssh-rsa AAAA kubefirst-bot");

        let err = step.run(&mut ledger).await.unwrap_err();
        assert!(format!("{err:#}").contains("401"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_key_already_registered_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "message": {"fingerprint": ["has already been taken"]}
            })))
            .mount(&server)
            .await;

        let client = GitLabClient::new(Client::new(), server.uri(), "glpat-1");
        client.upload_ssh_key("kubefirst", "ssh-rsa AAAA").await.unwrap();
    }

    fn mount_application(server: &MockServer, app: &'static str) -> Mock {
        Mock::given(method("POST"))
            .and(path("/api/v4/applications"))
            .and(header("PRIVATE-TOKEN", "glpat-1"))
            .and(body_string_contains(format!("name={app}&")))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": 1,
                "application_id": format!("{app}-id"),
                "application_name": app,
                "secret": format!("{app}-secret"),
                "callback_url": "https://example.com/callback"
            })))
            .named(format!("create {app} on {}", server.uri()))
    }

    #[tokio::test]
    async fn test_oidc_registers_apps_and_writes_vault() {
        let server = MockServer::start().await;
        for app in OIDC_APPS {
            mount_application(&server, app).expect(1).mount(&server).await;
        }
        Mock::given(method("GET"))
            .and(path("/api/v4/applications"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "application_id": "argo-id", "application_name": "argo"},
                {"id": 2, "application_id": "argocd-id", "application_name": "argocd"},
                {"id": 3, "application_id": "vault-id", "application_name": "vault"}
            ])))
            .mount(&server)
            .await;
        for app in OIDC_APPS {
            Mock::given(method("POST"))
                .and(path(format!("/v1/secret/data/oidc/{app}")))
                .and(header("X-Vault-Token", "hvs.root"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let step = GitLabOidcStep::with_targets(server.uri(), server.uri(), "example.com", Client::new());
        let mut ledger = Ledger::in_memory();
        ledger.set("gitlab.token", "glpat-1");
        ledger.set("vault.token", "hvs.root");

        step.run(&mut ledger).await.unwrap();

        assert_eq!(ledger.text("gitlab.oidc.argocd.applicationid"), Some("argocd-id"));
        assert_eq!(ledger.text("gitlab.oidc.vault.secret"), Some("vault-secret"));
        assert!(ledger.flag("gitlab.oidc.argo.stored"));
    }

    #[tokio::test]
    async fn test_oidc_skips_stored_and_retries_vault_write() {
        let server = MockServer::start().await;
        // No application may be created: argo is stored, argocd/vault have ids.
        Mock::given(method("POST"))
            .and(path("/api/v4/applications"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/oidc/argo"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        for app in ["argocd", "vault"] {
            Mock::given(method("POST"))
                .and(path(format!("/v1/secret/data/oidc/{app}")))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;
        }

        let step = GitLabOidcStep::with_targets(server.uri(), server.uri(), "example.com", Client::new());
        let mut ledger = Ledger::in_memory();
        ledger.set("gitlab.token", "glpat-1");
        ledger.set("vault.token", "hvs.root");
        ledger.set("gitlab.oidc.argo.stored", true);
        for app in ["argocd", "vault"] {
            ledger.set(format!("gitlab.oidc.{app}.applicationid"), format!("{app}-id"));
            ledger.set(format!("gitlab.oidc.{app}.secret"), format!("{app}-secret"));
        }

        step.run(&mut ledger).await.unwrap();
        assert!(ledger.flag("gitlab.oidc.vault.stored"));
    }
}
