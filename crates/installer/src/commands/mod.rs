//! CLI subcommands.

pub mod create;
pub mod destroy;
pub mod status;

use std::path::Path;

use anyhow::Result;
use clap::Args;

use crate::config::{GitOrigin, InstallConfig};

/// Flags shared by the commands that provision or tear down.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Hosted zone to build under (e.g. example.com)
    #[arg(long, value_name = "DOMAIN")]
    pub domain_name: Option<String>,

    /// Cloud region
    #[arg(long)]
    pub region: Option<String>,

    /// Civo API token
    #[arg(long, env = "CIVO_TOKEN", hide_env_values = true)]
    pub civo_token: Option<String>,

    /// Log every step's intent without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the DNS propagation check
    #[arg(long)]
    pub skip_domain_check: bool,

    /// Git server the gitops repository is pushed to (gitlab, soft)
    #[arg(long, value_name = "ORIGIN")]
    pub git_origin: Option<GitOrigin>,
}

impl ConfigArgs {
    /// Layer flags over the config file (or defaults).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded.
    pub fn resolve(&self, config_file: Option<&Path>) -> Result<InstallConfig> {
        let mut config = match config_file {
            Some(path) => InstallConfig::load(path)?,
            None => InstallConfig::default(),
        };

        if let Some(domain) = &self.domain_name {
            config.domain_name.clone_from(domain);
        }
        if let Some(region) = &self.region {
            config.region.clone_from(region);
        }
        if let Some(token) = &self.civo_token {
            config.civo_token.clone_from(token);
        }
        if let Some(origin) = self.git_origin {
            config.git_origin = origin;
        }
        config.dry_run |= self.dry_run;
        config.skip_domain_check |= self.skip_domain_check;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "domain_name: file.example.com\nregion: NYC1\nskip_domain_check: true\n")
            .unwrap();

        let args = ConfigArgs {
            domain_name: Some("flag.example.com".into()),
            git_origin: Some(GitOrigin::Soft),
            ..ConfigArgs::default()
        };
        let config = args.resolve(Some(&file)).unwrap();

        assert_eq!(config.domain_name, "flag.example.com");
        assert_eq!(config.region, "NYC1");
        assert!(config.skip_domain_check);
        assert_eq!(config.git_origin, GitOrigin::Soft);
        assert!(!config.dry_run);
    }
}
