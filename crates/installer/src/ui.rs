//! UI helpers for the installer CLI.
//!
//! Provides consistent formatting for console output during provisioning.

use colored::Colorize;

/// Print the installer banner.
pub fn print_banner() {
    println!();
    println!("{}", "  GitOps Platform Installer".cyan().bold());
    println!(
        "  {}",
        "DNS, cluster, GitLab, Vault and GitOps in one resumable run".bright_black()
    );
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Mask a secret for display, keeping a short prefix.
#[must_use]
pub fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("glpat-abcdef"), "glpa****");
        assert_eq!(mask("abc"), "****");
    }
}
