use std::fmt::Write as _;

use clap::Args;
use common::ledger::{CheckpointStore, FileLedger, LedgerError};
use common::migrate::{MigrationPlan, StagedArchive};

use super::RootArgs;
use crate::state::AppState;

/// Show what an earlier run left behind for a root.
#[derive(Args, Debug, Clone)]
pub struct Status {
    #[command(flatten)]
    pub root: RootArgs,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("{0}")]
    State(#[from] crate::state::StateError),
    #[error("ledger unreadable: {0}")]
    Ledger(#[from] LedgerError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = StatusError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let workspace = state.workspace();
        let plan = MigrationPlan::new(
            state.config.source.principal(),
            state.config.destination.principal(),
            self.root.selector(),
        );

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} from {} to {}",
            plan.selector, plan.source_principal, plan.dest_principal
        );

        let archive_path = workspace.archive_path(&plan);
        let archive = match StagedArchive::open(&archive_path) {
            Some(staged) => match staged.load_index() {
                Ok(index) if index.is_complete() => {
                    format!("packed, {} paths indexed", index.paths.len())
                }
                Ok(index) => format!(
                    "packed with {} failures, will be downloaded again",
                    index.failures
                ),
                Err(err) => format!("index unreadable ({})", err),
            },
            None => "none".to_string(),
        };
        let _ = writeln!(out, "- Staged archive: {}", archive);

        let ledger_path = workspace.ledger_path(&plan);
        if ledger_path.exists() {
            let ledger = FileLedger::open(&ledger_path)?;
            let _ = write!(
                out,
                "- Ledger: {} units uploaded ({})",
                ledger.len().await?,
                ledger_path.display()
            );
        } else {
            let _ = write!(out, "- Ledger: nothing uploaded yet");
        }

        Ok(out)
    }
}
