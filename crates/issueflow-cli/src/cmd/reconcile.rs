use anyhow::Result;
use issueflow_core::config::Config;

use super::{block_on, open_state};
use crate::output::{print_json, print_table};

/// Report decisions whose transition never committed. Nothing is repaired;
/// redelivering the event (or a new comment) re-runs the analysis.
pub fn run(config: &Config, json: bool) -> Result<()> {
    let state = open_state(config)?;
    let cases = block_on(async { Ok(state.orchestrator.reconcile().await?) })?;

    if json {
        return print_json(&cases);
    }
    if cases.is_empty() {
        println!("Nothing to reconcile.");
        return Ok(());
    }

    let rows = cases
        .iter()
        .map(|c| {
            vec![
                format!("{}#{}", c.repo_full_name, c.issue_number),
                c.current_status.to_string(),
                c.target_status.to_string(),
                c.event_id.clone(),
                c.logged_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["ISSUE", "CURRENT", "DECIDED", "EVENT", "LOGGED"], rows);
    Ok(())
}
