use anyhow::Result;
use issueflow_core::config::Config;

use super::{block_on, open_state};
use crate::output::{print_json, print_table};

pub fn run(config: &Config, repo: &str, issue: u64, json: bool) -> Result<()> {
    let state = open_state(config)?;
    let status = block_on(async { Ok(state.orchestrator.workflow_status(repo, issue).await?) })?;

    if json {
        return print_json(&status);
    }

    println!("{repo}#{issue}: {}", status.stage);
    if !status.exists {
        return Ok(());
    }
    if let Some(id) = status.conversation_id {
        println!("conversation: {id}  (version {})", status.version);
    }
    println!(
        "turns: {}  actions: {}  generations: {}",
        status.turn_count, status.action_count, status.generation_count
    );
    if let Some(g) = &status.latest_generation {
        let pr = g
            .pr_number
            .map(|n| format!("#{n}"))
            .unwrap_or_else(|| "-".to_string());
        println!("latest generation: {} {} PR {pr}", g.id, g.status);
    }

    if !status.transitions.is_empty() {
        println!();
        let rows = status
            .transitions
            .iter()
            .map(|t| {
                vec![
                    t.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    t.from.to_string(),
                    t.to.to_string(),
                    t.event_id.clone(),
                ]
            })
            .collect();
        print_table(&["AT", "FROM", "TO", "EVENT"], rows);
    }
    Ok(())
}
