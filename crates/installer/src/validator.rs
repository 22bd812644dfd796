use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;

use crate::config::InstallConfig;
use crate::ui;

/// Binaries every real run shells out to.
pub const REQUIRED_TOOLS: [(&str, &str); 4] = [
    ("terraform", "Install Terraform from https://developer.hashicorp.com/terraform/install"),
    ("kubectl", "Install kubectl from https://kubernetes.io/docs/tasks/tools/"),
    ("git", "Install git from https://git-scm.com/downloads"),
    ("ssh-keygen", "Install the OpenSSH client tools"),
];

/// Validates prerequisites before a provisioning run
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    check: Box<dyn Fn() -> Result<bool>>,
    install_instructions: String,
    critical: bool,
}

/// Locate `name` in the pinned tools directory, falling back to `PATH`.
#[must_use]
pub fn find_tool(tools_dir: &Path, name: &str) -> Option<PathBuf> {
    let pinned = tools_dir.join(name);
    if pinned.is_file() {
        return Some(pinned);
    }
    which::which(name).ok()
}

impl PrerequisitesValidator {
    pub fn new(config: &InstallConfig) -> Self {
        let mut requirements = Vec::new();

        for (tool, instructions) in REQUIRED_TOOLS {
            let tools_dir = config.tools_dir.clone();
            requirements.push(Requirement {
                name: tool.to_string(),
                check: Box::new(move || Ok(find_tool(&tools_dir, tool).is_some())),
                install_instructions: instructions.to_string(),
                critical: true,
            });
        }

        // Civo credentials
        let has_token = !config.civo_token.trim().is_empty();
        requirements.push(Requirement {
            name: "Civo API token".to_string(),
            check: Box::new(move || Ok(has_token)),
            install_instructions: "Export CIVO_TOKEN or set civo_token in the config file"
                .to_string(),
            critical: true,
        });

        // AWS profile for the Terraform state backend (optional)
        let profile = config.aws_profile.clone();
        requirements.push(Requirement {
            name: "AWS profile".to_string(),
            check: Box::new(move || Ok(profile.is_some())),
            install_instructions: "Set aws_profile to select a shared-credentials profile"
                .to_string(),
            critical: false,
        });

        Self { requirements }
    }

    /// Names of critical requirements that are not met.
    #[must_use]
    pub fn missing_critical(&self) -> Vec<&str> {
        self.requirements
            .iter()
            .filter(|r| r.critical && !matches!((r.check)(), Ok(true)))
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        println!();
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            if let Ok(true) = (requirement.check)() {
                ui::print_check_result(&requirement.name, true, None);
            } else {
                ui::print_check_result(&requirement.name, false, None);
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
        } else {
            ui::print_warning("Some prerequisites are not met:");
            println!();
            for failure in &failures {
                if failure.critical {
                    println!(
                        "  {} {} - {}",
                        "✗".red(),
                        failure.name.red(),
                        failure.install_instructions.bright_black()
                    );
                } else {
                    println!(
                        "  {} {} - {}",
                        "⚠".yellow(),
                        failure.name.yellow(),
                        failure.install_instructions.bright_black()
                    );
                }
            }
            println!();

            if failures.iter().any(|f| f.critical) {
                return Err(anyhow::anyhow!(
                    "Critical prerequisites not met. Please install the required tools and try again."
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pinned_tool_preferred() {
        let dir = TempDir::new().unwrap();
        let pinned = dir.path().join("terraform-pinned-for-test");
        std::fs::write(&pinned, "").unwrap();

        assert_eq!(
            find_tool(dir.path(), "terraform-pinned-for-test"),
            Some(pinned)
        );
        assert_eq!(find_tool(dir.path(), "definitely-not-a-real-binary-x9"), None);
    }

    #[test]
    fn test_missing_token_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = InstallConfig::with_defaults("example.com").with_workspace(dir.path());

        let validator = PrerequisitesValidator::new(&config);
        assert!(validator.missing_critical().contains(&"Civo API token"));
        assert!(!validator.missing_critical().contains(&"AWS profile"));
    }
}
