//! GitOps Platform Installer Library.
//!
//! Provisions a DNS-verified cloud cluster running GitLab, Vault and ArgoCD
//! and hydrates its GitOps repositories. Every step is checkpointed in the
//! workspace ledger, so re-running a command resumes after the last
//! completed step.
//!
//! # Example
//!
//! ```ignore
//! use gitops_installer::{InstallConfig, Installer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = InstallConfig::with_defaults("example.com");
//!     let installer = Installer::new(config, CancellationToken::new())?;
//!     let steps = installer.create_steps();
//!     installer.run("Create", &steps).await?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod dns;
pub mod git;
pub mod gitlab;
pub mod gitops;
pub mod k8s;
pub mod orchestrator;
pub mod terraform;
pub mod ui;
pub mod validator;
pub mod vault;

// Re-export commonly used types at the crate root
pub use config::{GitOrigin, InstallConfig};
pub use context::InstallContext;
pub use orchestrator::Installer;
