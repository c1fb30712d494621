use anyhow::Result;
use issueflow_core::config::{Config, WarnLevel};
use issueflow_server::AppState;

use super::block_on;

pub fn run(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    for w in config.validate() {
        match w.level {
            WarnLevel::Error => tracing::error!("{}", w.message),
            WarnLevel::Warning => tracing::warn!("{}", w.message),
        }
    }
    config.ensure_valid()?;

    let state = AppState::from_config(&config)?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        println!("issueflow listening on http://localhost:{port}");

        tokio::select! {
            res = issueflow_server::serve_on(listener, state) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                Ok(())
            }
        }
    })
}
