use anyhow::{bail, Result};
use issueflow_core::config::Config;
use issueflow_core::store::ActionQuery;
use uuid::Uuid;

use super::{block_on, open_state};
use crate::output::{print_json, print_table, truncate};

pub fn run(
    config: &Config,
    conversation: Option<Uuid>,
    action_type: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    if limit == 0 {
        bail!("--limit must be greater than 0");
    }
    let state = open_state(config)?;
    let query = ActionQuery {
        conversation_id: conversation,
        action_type,
        limit: Some(limit),
    };
    let actions = block_on(async { Ok(state.store().list_actions(query).await?) })?;

    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No actions recorded.");
        return Ok(());
    }

    let rows = actions
        .iter()
        .map(|a| {
            vec![
                a.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                a.agent.to_string(),
                a.action_type().to_string(),
                a.status.to_string(),
                format!("{}ms", a.execution_time_ms),
                a.conversation_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                truncate(a.error_message.as_deref().unwrap_or(""), 48),
            ]
        })
        .collect();
    print_table(
        &["AT", "AGENT", "TYPE", "STATUS", "TIME", "CONVERSATION", "ERROR"],
        rows,
    );
    Ok(())
}
