use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;
use issueflow_core::config::{Config, WarnLevel};

use crate::output::print_json;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the configuration for common mistakes
    Check,

    /// Print the effective configuration with secrets redacted
    Show,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config: &Config, path: &Path, subcmd: ConfigSubcommand, json: bool) -> Result<()> {
    match subcmd {
        ConfigSubcommand::Check => check(config, path, json),
        ConfigSubcommand::Show => show(config, json),
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn check(config: &Config, path: &Path, json: bool) -> Result<()> {
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "file_found": path.exists(),
            "ok": errors == 0,
            "warnings": warnings,
        }))?;
    } else {
        if !path.exists() {
            println!("{} not found, using defaults", path.display());
        }
        if warnings.is_empty() {
            println!("config ok");
        }
        for w in &warnings {
            let tag = match w.level {
                WarnLevel::Error => "error",
                WarnLevel::Warning => "warning",
            };
            println!("{tag}: {}", w.message);
        }
    }

    if errors > 0 {
        bail!("{errors} configuration error(s)");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

const REDACTED: &str = "<redacted>";

fn redact(value: &mut String) {
    if !value.is_empty() {
        *value = REDACTED.to_string();
    }
}

fn show(config: &Config, json: bool) -> Result<()> {
    let mut shown = config.clone();
    redact(&mut shown.webhook.secret);
    redact(&mut shown.github.token);
    redact(&mut shown.llm.api_key);

    if json {
        return print_json(&shown);
    }
    print!("{}", serde_yaml::to_string(&shown)?);
    Ok(())
}
