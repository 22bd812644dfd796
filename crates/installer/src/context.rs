//! Shared collaborators handed to every provisioning step.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use provision_engine::{Invocation, Poller, ProcessRunner};
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::InstallConfig;
use crate::k8s::KubeClient;

/// Timeout for individual API requests.
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Configuration plus the clients and runners steps share.
pub struct InstallContext {
    pub config: InstallConfig,
    pub runner: ProcessRunner,
    pub http: Client,
    pub cancel: CancellationToken,
}

impl InstallContext {
    /// Build the shared context for one run.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: InstallConfig, cancel: CancellationToken) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            runner: ProcessRunner::new().with_cancellation(cancel.clone()),
            http,
            cancel,
        })
    }

    /// Connect to the cluster created by the base Terraform module.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig is missing or invalid.
    pub async fn kube(&self) -> Result<KubeClient> {
        KubeClient::from_kubeconfig(&self.config.kubeconfig_path()).await
    }

    /// `kubectl --kubeconfig <path> -n <namespace>` ready for more arguments.
    #[must_use]
    pub fn kubectl(&self, namespace: &str) -> Invocation {
        Invocation::new(self.config.tool("kubectl"))
            .arg("--kubeconfig")
            .arg(self.config.kubeconfig_path())
            .args(["-n", namespace])
    }

    /// Attach the run's cancellation token to a poller preset.
    #[must_use]
    pub fn poller(&self, preset: Poller) -> Poller {
        preset.with_cancellation(self.cancel.clone())
    }

    #[must_use]
    pub fn git_bin(&self) -> PathBuf {
        self.config.tool("git")
    }
}
