use anyhow::Result;
use issueflow_core::config::Config;

use super::{block_on, open_state};
use crate::output::print_json;

/// Poll the pull request and apply a merge or close that was missed.
pub fn run(config: &Config, repo: &str, pr: u64, json: bool) -> Result<()> {
    let state = open_state(config)?;
    let outcome = block_on(async { Ok(state.orchestrator.sync_pull_request(repo, pr).await?) })?;

    if json {
        return print_json(&outcome);
    }
    let value = serde_json::to_value(&outcome)?;
    let kind = value["kind"].as_str().unwrap_or("unknown");
    match value["reason"].as_str() {
        Some(reason) => println!("{repo} PR #{pr}: {kind} ({reason})"),
        None => println!("{repo} PR #{pr}: {kind}"),
    }
    Ok(())
}
