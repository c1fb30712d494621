pub mod actions;
pub mod config;
pub mod conversations;
pub mod reconcile;
pub mod serve;
pub mod status;
pub mod sync;

use anyhow::Result;
use issueflow_core::config::Config;
use issueflow_server::AppState;

/// Run `fut` to completion on a fresh runtime.
pub(crate) fn block_on<F, T>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}

/// Open the configured database with the same wiring the server uses.
pub(crate) fn open_state(config: &Config) -> Result<AppState> {
    AppState::from_config(config)
}
