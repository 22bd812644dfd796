use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Args;
use provision_engine::{Ledger, LedgerValue};

use super::ConfigArgs;
use crate::ui;

/// Key fragments whose values are never printed in full.
const SECRET_MARKERS: [&str; 4] = ["token", "password", "secret", "privatekey"];

/// Show the checkpoints and values recorded so far
#[derive(Args, Debug)]
pub struct StatusCommand {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print secret values unmasked
    #[arg(long)]
    show_secrets: bool,
}

/// Whether the value under `key` is a credential.
#[must_use]
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SECRET_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Render one ledger value for display.
#[must_use]
pub fn display_value(key: &str, value: &LedgerValue, show_secrets: bool) -> String {
    match value {
        LedgerValue::Text(text) if !show_secrets && is_secret_key(key) => ui::mask(text),
        LedgerValue::Text(text) => text.lines().next().unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

impl StatusCommand {
    pub fn run(&self, config_file: Option<&Path>) -> Result<()> {
        let config = self.config.resolve(config_file)?;
        let path = config.state_file();

        ui::print_section("Provisioning state");
        ui::print_kv("State file", &path.display().to_string());

        if !path.exists() {
            ui::print_info("Nothing recorded yet");
            return Ok(());
        }

        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified: DateTime<Local> = modified.into();
        ui::print_kv("Last updated", &modified.format("%Y-%m-%d %H:%M:%S").to_string());

        let ledger = Ledger::load(&path)?;
        println!();
        for (key, value) in ledger.entries() {
            ui::print_kv(key, &display_value(key, value, self.show_secrets));
        }
        println!();
        ui::print_info(&format!("{} entries", ledger.len()));
        Ok(())
    }
}
