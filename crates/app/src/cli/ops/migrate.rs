use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;
use std::thread;

use clap::Args;
use common::migrate::{ItemFailure, Migration, MigrationError, MigrationPlan, MigrationReport};
use common::progress::{CancelFlag, ChannelObserver, ProgressReceiver};

use super::RootArgs;
use crate::logging::init_logging;
use crate::state::AppState;

#[derive(Args, Debug, Clone)]
pub struct Migrate {
    #[command(flatten)]
    pub root: RootArgs,

    /// Keep the staging archive and extracted tree after a clean run
    #[arg(long)]
    pub keep_staging: bool,

    /// Do not print progress to stderr
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("{0}")]
    State(#[from] crate::state::StateError),
    #[error("{0:#}")]
    Setup(#[from] anyhow::Error),
    #[error("migration aborted: {0}")]
    Migration(#[from] MigrationError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Migrate {
    type Error = MigrateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let _guards = init_logging(&state.config.log_level, &state.logs_dir);

        let source = state.config.source.connect()?;
        let dest = state.config.destination.connect()?;

        let mut plan = MigrationPlan::new(
            state.config.source.principal(),
            state.config.destination.principal(),
            self.root.selector(),
        )
        .keep_staging(self.keep_staging || state.config.keep_staging);
        if let Some(domains) = &state.config.domains {
            plan = plan.with_domains(domains.clone());
        }

        let cancel = CancelFlag::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping after the current item");
                interrupt.cancel();
            }
        });

        let (observer, events) = ChannelObserver::new();
        let quiet = self.quiet;
        let watcher = thread::spawn(move || watch_progress(events, quiet));

        let migration = Migration::new(&source, &dest, state.workspace())
            .with_retry(state.config.retry.policy())
            .with_observer(Arc::new(observer))
            .with_cancel(cancel);
        let result = migration.run(&plan).await;

        // Dropping the last sender ends the watcher.
        drop(migration);
        if watcher.join().is_err() {
            tracing::warn!("progress watcher panicked");
        }

        let report = result?;
        Ok(summarize(&plan, &report))
    }
}

/// Render each event over the previous one on stderr.
fn watch_progress(events: ProgressReceiver, quiet: bool) {
    let mut shown = false;
    while let Some(event) = events.recv() {
        if quiet {
            continue;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{}", event);
        let _ = stderr.flush();
        shown = true;
    }
    if shown {
        eprintln!();
    }
}

fn summarize(plan: &MigrationPlan, report: &MigrationReport) -> String {
    let mut out = String::new();
    let status = if report.is_complete() {
        "complete"
    } else {
        "incomplete, run again to resume"
    };
    let _ = writeln!(
        out,
        "Migrated {} from {} to {}: {}",
        plan.selector, plan.source_principal, plan.dest_principal, status
    );

    match &report.download {
        Some(download) => {
            let _ = writeln!(
                out,
                "- Downloaded: {} files, {} exported, {} folders, {} shortcuts",
                download.files, download.exported, download.folders, download.shortcuts
            );
            list_failures(&mut out, "Skipped", &download.skipped);
            list_failures(&mut out, "Failed to download", &download.failed);
            list_failures(&mut out, "Incomplete", &download.incomplete_branches);
        }
        None => {
            let _ = writeln!(out, "- Downloaded: reused staged archive");
        }
    }

    let upload = &report.upload;
    let _ = writeln!(
        out,
        "- Uploaded: {} files, {} folders created, {} reused, {} already done",
        upload.files_created,
        upload.folders_created,
        upload.folders_reused,
        upload.skipped_existing
    );
    list_failures(&mut out, "Failed to upload", &upload.failed);
    list_failures(&mut out, "Not uploaded", &upload.incomplete_branches);

    if plan.domains.is_some() {
        let _ = writeln!(
            out,
            "- Permissions: {} created, {} skipped, {} failed",
            upload.permissions.created, upload.permissions.skipped, upload.permissions.failed
        );
    }

    let shortcuts = &report.shortcuts;
    let _ = writeln!(
        out,
        "- Shortcuts: {} created, {} existing, {} unresolved, {} failed",
        shortcuts.created, shortcuts.existing, shortcuts.unresolved, shortcuts.failed
    );
    let _ = write!(
        out,
        "- Staging: {}",
        if report.staging_removed {
            "removed"
        } else {
            "kept"
        }
    );
    out
}

fn list_failures(out: &mut String, label: &str, failures: &[ItemFailure]) {
    for failure in failures {
        let _ = writeln!(out, "  {}: {} ({})", label, failure.path, failure.error);
    }
}
