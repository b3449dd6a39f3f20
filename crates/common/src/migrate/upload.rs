//! Tree upload
//!
//! Recreates the staged tree under a destination parent. The ledger makes
//! the walk resumable: a path it holds is skipped without descending. Files
//! are recorded right after their content lands; a folder is recorded only
//! once everything below it has, so an interrupted run comes back to it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use walkdir::WalkDir;

use super::context::MigrationContext;
use super::error::{ItemFailure, MigrationError};
use super::permissions::{PermissionMigrator, PermissionReport};
use crate::path::TreePath;
use crate::progress::Phase;
use crate::retry::{with_retry, RetryError, RetryPolicy};
use crate::store::{NodeKind, RemoteStore};

/// Folder name to id, per destination parent.
///
/// A parent is listed once, the first time a child folder is requested
/// under it. Folders created here start with an empty, already loaded
/// listing, so a fresh subtree costs no listing calls at all.
#[derive(Debug, Default)]
pub struct FolderCache {
    parents: HashMap<String, HashMap<String, String>>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the folder `name` under `parent_id`, creating it if absent.
    /// The flag tells whether it was created.
    pub async fn find_or_create(
        &mut self,
        store: &dyn RemoteStore,
        retry: &RetryPolicy,
        parent_id: &str,
        name: &str,
    ) -> Result<(String, bool), RetryError> {
        if !self.parents.contains_key(parent_id) {
            let children = with_retry(retry, "list children", move || {
                store.list_children(parent_id)
            })
            .await?;
            let mut folders = HashMap::new();
            for child in children {
                if child.kind() == NodeKind::Folder {
                    folders.entry(child.name).or_insert(child.id);
                }
            }
            self.parents.insert(parent_id.to_string(), folders);
        }

        if let Some(id) = self.parents.get(parent_id).and_then(|f| f.get(name)) {
            return Ok((id.clone(), false));
        }

        let id = with_retry(retry, "create folder", move || {
            store.create_folder(parent_id, name)
        })
        .await?;
        self.parents
            .entry(parent_id.to_string())
            .or_default()
            .insert(name.to_string(), id.clone());
        self.parents.insert(id.clone(), HashMap::new());
        Ok((id, true))
    }

    /// Walk `path` down from `root_id`, creating missing folders.
    pub async fn resolve_path(
        &mut self,
        store: &dyn RemoteStore,
        retry: &RetryPolicy,
        root_id: &str,
        path: &TreePath,
    ) -> Result<String, RetryError> {
        let mut current = root_id.to_string();
        for segment in path.segments() {
            let (id, _) = self.find_or_create(store, retry, &current, segment).await?;
            current = id;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    pub folders_created: u64,
    pub folders_reused: u64,
    pub files_created: u64,
    /// Units the ledger already held
    pub skipped_existing: u64,
    pub failed: Vec<ItemFailure>,
    /// Folders that could not be created; nothing below them was uploaded
    pub incomplete_branches: Vec<ItemFailure>,
    pub permissions: PermissionReport,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.incomplete_branches.is_empty()
    }
}

/// Upload everything under `staging_dir` beneath `dest_root`.
pub async fn upload(
    store: &dyn RemoteStore,
    staging_dir: &Path,
    dest_root: &str,
    folders: &mut FolderCache,
    permissions: Option<&PermissionMigrator<'_>>,
    ctx: &mut MigrationContext,
) -> Result<UploadReport, MigrationError> {
    let total = count_files(staging_dir);
    let mut uploader = TreeUploader {
        store,
        folders,
        permissions,
        ctx,
        report: UploadReport::default(),
        completed: 0,
        total,
    };
    uploader
        .walk(staging_dir.to_path_buf(), TreePath::root(), dest_root.to_string())
        .instrument(tracing::info_span!("upload", dest_root))
        .await?;
    Ok(uploader.report)
}

struct StagedEntry {
    name: String,
    local: PathBuf,
    is_dir: bool,
}

struct TreeUploader<'a, 'p> {
    store: &'a dyn RemoteStore,
    folders: &'a mut FolderCache,
    permissions: Option<&'a PermissionMigrator<'p>>,
    ctx: &'a mut MigrationContext,
    report: UploadReport,
    completed: u64,
    total: u64,
}

impl TreeUploader<'_, '_> {
    /// Returns whether every unit under `local` is now in the ledger.
    fn walk(
        &mut self,
        local: PathBuf,
        path: TreePath,
        parent_id: String,
    ) -> BoxFuture<'_, Result<bool, MigrationError>> {
        async move {
            let mut complete = true;
            for entry in read_sorted(&local)? {
                self.ctx.check_cancelled()?;
                let child = path.join_staged(&entry.name);

                if self.ctx.ledger.contains(&child).await? {
                    tracing::debug!(path = %child, "already uploaded, skipping");
                    self.report.skipped_existing += 1;
                    let leaves = if entry.is_dir {
                        count_files(&entry.local)
                    } else {
                        1
                    };
                    self.advance(&entry.name, leaves);
                    continue;
                }

                let result = if entry.is_dir {
                    self.upload_folder(&entry, child, &parent_id).await
                } else {
                    let result = self.upload_file(&entry, child, &parent_id).await;
                    self.advance(&entry.name, 1);
                    result
                };

                match result {
                    Ok(true) => {}
                    Ok(false) => complete = false,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        complete = false;
                        let (path, source) = match err {
                            MigrationError::Remote { path, source, .. }
                            | MigrationError::Listing { path, source } => (path, source),
                            other => return Err(other),
                        };
                        let failure = ItemFailure::new(path, source);
                        if entry.is_dir {
                            self.report.incomplete_branches.push(failure);
                        } else {
                            self.report.failed.push(failure);
                        }
                    }
                }
            }
            Ok(complete)
        }
        .boxed()
    }

    async fn upload_folder(
        &mut self,
        entry: &StagedEntry,
        path: TreePath,
        parent_id: &str,
    ) -> Result<bool, MigrationError> {
        let (folder_id, created) = self
            .folders
            .find_or_create(self.store, &self.ctx.retry, parent_id, &entry.name)
            .await
            .map_err(|source| {
                tracing::error!(folder = %path, error = %source, "folder could not be created");
                MigrationError::Remote {
                    operation: "create folder",
                    path: path.clone(),
                    source,
                }
            })?;
        if created {
            self.report.folders_created += 1;
        } else {
            self.report.folders_reused += 1;
            tracing::debug!(folder = %path, "reusing existing folder");
        }
        self.map_unit(&path, &folder_id).await?;

        let complete = self
            .walk(entry.local.clone(), path.clone(), folder_id)
            .await?;

        if !complete {
            tracing::warn!(folder = %path, "folder left open, some units did not upload");
            return Ok(false);
        }
        if self.ctx.index.incomplete.contains(&path) {
            tracing::warn!(folder = %path, "staged copy was incomplete, folder left open");
            return Ok(false);
        }
        self.ctx.ledger.record(&path).await?;
        tracing::info!(folder = %path, "folder uploaded");
        Ok(true)
    }

    async fn upload_file(
        &mut self,
        entry: &StagedEntry,
        path: TreePath,
        parent_id: &str,
    ) -> Result<bool, MigrationError> {
        let size = fs::metadata(&entry.local)
            .map_err(|err| MigrationError::io(&entry.local, err))?
            .len();

        let store = self.store;
        let name = entry.name.as_str();
        let local = entry.local.as_path();
        let file_id = with_retry(&self.ctx.retry, "create file", move || {
            store.create_file(parent_id, name, local)
        })
        .await
        .map_err(|source| {
            tracing::error!(path = %path, error = %source, "upload failed");
            MigrationError::Remote {
                operation: "create file",
                path: path.clone(),
                source,
            }
        })?;

        self.report.files_created += 1;
        self.map_unit(&path, &file_id).await?;
        self.ctx.ledger.record(&path).await?;
        tracing::info!(path = %path, bytes = size, "uploaded");
        Ok(true)
    }

    /// Remember where a unit landed and carry its permissions over. The
    /// mapping is durable before the unit reaches the ledger.
    async fn map_unit(&mut self, path: &TreePath, dest_id: &str) -> Result<(), MigrationError> {
        let Some(source_id) = self.ctx.index.paths.get(path).cloned() else {
            return Ok(());
        };
        self.ctx.map_id(&source_id, dest_id)?;
        if let Some(migrator) = self.permissions {
            let report = migrator.migrate(&source_id, dest_id).await;
            self.report.permissions.absorb(report);
        }
        Ok(())
    }

    fn advance(&mut self, item: &str, leaves: u64) {
        self.completed += leaves;
        self.ctx
            .notify(item, Phase::Uploading, self.completed, self.total);
    }
}

fn read_sorted(dir: &Path) -> Result<Vec<StagedEntry>, MigrationError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| MigrationError::io(dir, err))? {
        let entry = entry.map_err(|err| MigrationError::io(dir, err))?;
        let local = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|err| MigrationError::io(&local, err))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!(name = ?raw, "skipping staged entry with a non utf-8 name");
                continue;
            }
        };
        entries.push(StagedEntry {
            name,
            local,
            is_dir: file_type.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn count_files(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count() as u64
}
