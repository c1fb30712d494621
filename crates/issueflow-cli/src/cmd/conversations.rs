use anyhow::Result;
use issueflow_core::config::Config;

use super::{block_on, open_state};
use crate::output::{print_json, print_table};

pub fn run(config: &Config, json: bool) -> Result<()> {
    let state = open_state(config)?;
    let conversations = block_on(async { Ok(state.store().list_conversations().await?) })?;

    if json {
        let list: Vec<serde_json::Value> = conversations
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "repo_full_name": c.repo_full_name,
                    "issue_number": c.issue_number,
                    "status": c.status,
                    "version": c.version,
                    "turn_count": c.turns.len(),
                    "updated_at": c.updated_at,
                })
            })
            .collect();
        return print_json(&list);
    }
    if conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }

    let rows = conversations
        .iter()
        .map(|c| {
            vec![
                format!("{}#{}", c.repo_full_name, c.issue_number),
                c.status.to_string(),
                c.version.to_string(),
                c.turns.len().to_string(),
                c.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["ISSUE", "STATUS", "VERSION", "TURNS", "UPDATED"], rows);
    Ok(())
}
