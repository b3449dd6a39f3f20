use clap::Args;
use common::store::RemoteStore;

use crate::state::AppState;

/// List the shared collections a store can see.
#[derive(Args, Debug, Clone)]
pub struct Collections {
    /// Ask the destination store instead of the source
    #[arg(long)]
    pub destination: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectionsError {
    #[error("{0}")]
    State(#[from] crate::state::StateError),
    #[error("{0:#}")]
    Setup(#[from] anyhow::Error),
    #[error("listing collections failed: {0}")]
    Store(#[from] common::store::StoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Collections {
    type Error = CollectionsError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let config = if self.destination {
            &state.config.destination
        } else {
            &state.config.source
        };
        let store = config.connect()?;

        let collections = store.list_collections().await?;
        if collections.is_empty() {
            return Ok(format!("No collections visible to {}", config.principal()));
        }

        let output = collections
            .iter()
            .map(|c| format!("{} ({})", c.name, c.id))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(output)
    }
}
