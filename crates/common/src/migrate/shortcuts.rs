use serde::{Deserialize, Serialize};

use super::context::MigrationContext;
use super::error::MigrationError;
use super::upload::FolderCache;
use crate::retry::with_retry;
use crate::store::RemoteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutReport {
    pub created: u64,
    /// Targets that were never migrated in this run
    pub unresolved: u64,
    /// Shortcuts an earlier run already recreated
    pub existing: u64,
    pub failed: u64,
}

/// Recreate recorded shortcuts at the destination, pointing at the migrated
/// copies of their targets.
///
/// Runs after the upload so the id mapping is complete. A shortcut whose
/// target has no mapping is skipped; a shortcut that cannot be created is
/// logged and counted. Only fatal errors abort.
pub async fn resolve_shortcuts(
    dest: &dyn RemoteStore,
    dest_root: &str,
    folders: &mut FolderCache,
    ctx: &MigrationContext,
) -> Result<ShortcutReport, MigrationError> {
    let mut report = ShortcutReport::default();

    for record in &ctx.index.shortcuts {
        ctx.check_cancelled()?;

        let key = record.ledger_key();
        if ctx.ledger.contains(&key).await? {
            report.existing += 1;
            continue;
        }

        let Some(target_id) = ctx.id_mapping.get(&record.target_id) else {
            tracing::warn!(
                shortcut = %record.name,
                target = %record.target_id,
                "shortcut target was not migrated, skipping"
            );
            report.unresolved += 1;
            continue;
        };

        let parent_id = match folders
            .resolve_path(dest, &ctx.retry, dest_root, &record.parent)
            .await
        {
            Ok(id) => id,
            Err(err) if err.is_fatal() => {
                return Err(MigrationError::Remote {
                    operation: "create folder",
                    path: record.parent.clone(),
                    source: err,
                })
            }
            Err(err) => {
                tracing::error!(folder = %record.parent, error = %err, "shortcut parent unavailable");
                report.failed += 1;
                continue;
            }
        };

        let name = record.name.as_str();
        let parent = parent_id.as_str();
        match with_retry(&ctx.retry, "create shortcut", move || {
            dest.create_shortcut(parent, name, target_id)
        })
        .await
        {
            Ok(_) => {
                ctx.ledger.record(&key).await?;
                tracing::info!(shortcut = %record.name, folder = %record.parent, "shortcut recreated");
                report.created += 1;
            }
            Err(err) if err.is_fatal() => {
                return Err(MigrationError::Remote {
                    operation: "create shortcut",
                    path: record.parent.child(&record.name),
                    source: err,
                })
            }
            Err(err) => {
                tracing::error!(shortcut = %record.name, error = %err, "shortcut could not be created");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
