//! Kubernetes access for the provisioning steps.
//!
//! Secrets are read to harvest credentials the platform charts generate
//! (ArgoCD admin password, GitLab root password, Vault unseal keys), pods
//! are looked up by label to find exec targets, and repository credential
//! Secrets are created for ArgoCD.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

/// Result of creating an object that may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Thin wrapper over a [`kube::Client`] bound to the installer's kubeconfig.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Create a client from a kubeconfig file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("Failed to read kubeconfig from {}", path.display()))?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("Failed to create Kubernetes config from kubeconfig")?;

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;

        Ok(Self { client })
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// All data entries of a Secret, decoded to raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the Secret cannot be read.
    pub async fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        debug!(namespace = %namespace, name = %name, "Reading secret");
        let secret = self
            .secrets(namespace)
            .get(name)
            .await
            .with_context(|| format!("Failed to read secret {namespace}/{name}"))?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    /// One value from a Secret as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns an error if the Secret cannot be read or the key is absent or empty.
    pub async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let data = self.secret_data(namespace, name).await?;
        let value = data
            .get(key)
            .with_context(|| format!("Secret {namespace}/{name} has no key '{key}'"))?;
        let value = String::from_utf8(value.clone())
            .with_context(|| format!("Secret {namespace}/{name} key '{key}' is not UTF-8"))?;
        if value.is_empty() {
            anyhow::bail!("Secret {namespace}/{name} key '{key}' is empty");
        }
        Ok(value)
    }

    /// Names of every Secret in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the list call fails.
    pub async fn secret_names(&self, namespace: &str) -> Result<Vec<String>> {
        let list = self
            .secrets(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list secrets in {namespace}"))?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    /// Name of a running pod matching `selector` (e.g. `app=toolbox`).
    ///
    /// # Errors
    ///
    /// Returns an error if the list call fails.
    pub async fn pod_name_by_label(&self, namespace: &str, selector: &str) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .with_context(|| format!("Failed to list pods in {namespace} with {selector}"))?;

        Ok(list
            .items
            .into_iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .and_then(|pod| pod.metadata.name))
    }

    /// Create a Secret. An existing Secret with the same name counts as success.
    ///
    /// # Errors
    ///
    /// Returns an error for any API failure other than a name conflict.
    pub async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .context("Secret has no namespace")?;
        let name = secret.metadata.name.as_deref().unwrap_or_default();

        match self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(_) => {
                info!(namespace = %namespace, name = %name, "Secret created");
                Ok(CreateOutcome::Created)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                info!(namespace = %namespace, name = %name, "Secret already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create secret {namespace}/{name}")),
        }
    }
}

/// Build an Opaque Secret from string data.
#[must_use]
pub fn opaque_secret(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
    data: &[(&str, &str)],
) -> Secret {
    let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    };

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(to_map(labels)),
            annotations: Some(to_map(annotations)),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}
