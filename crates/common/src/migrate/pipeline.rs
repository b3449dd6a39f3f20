//! End-to-end run: download, pack, unpack, upload, shortcuts, cleanup.
//!
//! All run state lives under a [`Workspace`] directory, keyed by the source
//! principal, the destination principal and the root selector:
//!
//! ```text
//! <workspace>/
//!   staging/<source>__<root>.tar.gz            packed tree
//!   staging/<source>__<root>.tar.gz.index.json path index, commit marker
//!   staging/extracted/<source>__<root>/        unpacked tree
//!   ledger/resume_<dest>_<root>.txt            checkpoint ledger
//!   ledger/resume_<dest>_<root>.ids            id journal, source to dest
//! ```
//!
//! A restarted run reuses a packed archive whose index says the download was
//! complete, and replays the ledger so finished units are not uploaded
//! twice. The ledger and id journal are kept after a successful run; staging
//! files are removed unless asked otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::archive::{ArchiveWriter, StagedArchive};
use super::context::MigrationContext;
use super::download::{download, DownloadReport, RootSelector};
use super::error::MigrationError;
use super::permissions::{DomainMapping, PermissionMigrator};
use super::shortcuts::{resolve_shortcuts, ShortcutReport};
use super::upload::{upload, FolderCache, UploadReport};
use crate::ledger::{FileLedger, IdJournal};
use crate::path::{sanitize_name, TreePath};
use crate::progress::{CancelFlag, NoopObserver, ProgressObserver};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{RemoteStore, ROOT_ID};

/// Folder that receives a migrated "shared with me" view at the destination.
pub const SHARED_WITH_ME_FOLDER: &str = "Shared with me";

/// What to migrate, and for whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Principal the source store acts as
    pub source_principal: String,
    /// Principal the destination store acts as
    pub dest_principal: String,
    pub selector: RootSelector,
    /// Rewrite and copy permissions when set
    pub domains: Option<DomainMapping>,
    /// Leave the archive and extracted tree behind after a clean run
    pub keep_staging: bool,
}

impl MigrationPlan {
    pub fn new(
        source_principal: impl Into<String>,
        dest_principal: impl Into<String>,
        selector: RootSelector,
    ) -> Self {
        Self {
            source_principal: source_principal.into(),
            dest_principal: dest_principal.into(),
            selector,
            domains: None,
            keep_staging: false,
        }
    }

    pub fn with_domains(mut self, domains: DomainMapping) -> Self {
        self.domains = Some(domains);
        self
    }

    pub fn keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = keep;
        self
    }

    fn staging_key(&self) -> String {
        format!(
            "{}__{}",
            sanitize_name(&self.source_principal),
            self.selector.label()
        )
    }

    fn ledger_key(&self) -> String {
        format!(
            "resume_{}_{}",
            sanitize_name(&self.dest_principal),
            self.selector.label()
        )
    }
}

/// Directory layout for staging files and ledgers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    pub fn archive_path(&self, plan: &MigrationPlan) -> PathBuf {
        self.staging_dir().join(format!("{}.tar.gz", plan.staging_key()))
    }

    pub fn extract_dir(&self, plan: &MigrationPlan) -> PathBuf {
        self.staging_dir().join("extracted").join(plan.staging_key())
    }

    pub fn ledger_path(&self, plan: &MigrationPlan) -> PathBuf {
        self.ledger_dir().join(format!("{}.txt", plan.ledger_key()))
    }

    pub fn id_journal_path(&self, plan: &MigrationPlan) -> PathBuf {
        self.ledger_dir().join(format!("{}.ids", plan.ledger_key()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// `None` when a packed archive from an earlier run was reused
    pub download: Option<DownloadReport>,
    pub upload: UploadReport,
    pub shortcuts: ShortcutReport,
    pub staging_removed: bool,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        !matches!(&self.download, Some(download) if !download.is_complete())
            && self.upload.is_complete()
            && self.shortcuts.failed == 0
    }
}

/// One source store, one destination store, and where to keep run state.
pub struct Migration<'a> {
    source: &'a dyn RemoteStore,
    dest: &'a dyn RemoteStore,
    workspace: Workspace,
    retry: RetryPolicy,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancelFlag,
}

impl<'a> Migration<'a> {
    pub fn new(
        source: &'a dyn RemoteStore,
        dest: &'a dyn RemoteStore,
        workspace: Workspace,
    ) -> Self {
        Self {
            source,
            dest,
            workspace,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    #[tracing::instrument(skip_all, fields(
        source = %plan.source_principal,
        dest = %plan.dest_principal,
        root = %plan.selector,
    ))]
    pub async fn run(&self, plan: &MigrationPlan) -> Result<MigrationReport, MigrationError> {
        let ledger = FileLedger::open(self.workspace.ledger_path(plan))?;
        let journal = IdJournal::open(self.workspace.id_journal_path(plan))?;
        let mut ctx = MigrationContext::new(Arc::new(ledger))
            .with_journal(Arc::new(journal))
            .with_retry(self.retry.clone())
            .with_observer(self.observer.clone())
            .with_cancel(self.cancel.clone());

        let archive_path = self.workspace.archive_path(plan);
        let extract_dir = self.workspace.extract_dir(plan);

        let reusable = match StagedArchive::open(&archive_path) {
            Some(staged) => match staged.load_index() {
                Ok(index) if index.is_complete() => Some((staged, index)),
                Ok(_) => {
                    tracing::info!("earlier download was incomplete, downloading again");
                    None
                }
                Err(err) => {
                    tracing::warn!(error = %err, "staged index unreadable, downloading again");
                    None
                }
            },
            None => None,
        };

        let (staged, download_report) = match reusable {
            Some((staged, index)) => {
                tracing::info!(archive = %archive_path.display(), "reusing packed archive");
                ctx.index = index;
                (staged, None)
            }
            None => {
                let mut writer = ArchiveWriter::create(&archive_path)?;
                let report = download(self.source, &plan.selector, &mut writer, &mut ctx).await?;
                let staged = writer.pack(&ctx.index)?;
                if extract_dir.exists() {
                    fs::remove_dir_all(&extract_dir)
                        .map_err(|err| MigrationError::io(&extract_dir, err))?;
                }
                (staged, Some(report))
            }
        };

        let staging_dir = staged.unpack(&extract_dir)?;

        let mut folders = FolderCache::new();
        let dest_root = self.destination_root(&plan.selector, &mut folders).await?;

        let permissions = plan.domains.clone().map(|domains| {
            PermissionMigrator::new(self.source, self.dest, domains, self.retry.clone())
        });

        let upload_report = upload(
            self.dest,
            &staging_dir,
            &dest_root,
            &mut folders,
            permissions.as_ref(),
            &mut ctx,
        )
        .await?;

        let shortcuts = resolve_shortcuts(self.dest, &dest_root, &mut folders, &ctx).await?;

        let mut report = MigrationReport {
            download: download_report,
            upload: upload_report,
            shortcuts,
            staging_removed: false,
        };

        if report.is_complete() && !plan.keep_staging {
            fs::remove_dir_all(&staging_dir)
                .map_err(|err| MigrationError::io(&staging_dir, err))?;
            staged.remove()?;
            report.staging_removed = true;
            tracing::info!("staging files removed");
        }

        tracing::info!(
            complete = report.is_complete(),
            files = report.upload.files_created,
            folders = report.upload.folders_created,
            skipped = report.upload.skipped_existing,
            shortcuts = report.shortcuts.created,
            "migration finished"
        );
        Ok(report)
    }

    /// Destination parent the migrated tree lands under.
    async fn destination_root(
        &self,
        selector: &RootSelector,
        folders: &mut FolderCache,
    ) -> Result<String, MigrationError> {
        let dest = self.dest;
        let root_error = |operation| {
            move |source| MigrationError::Remote {
                operation,
                path: TreePath::root(),
                source,
            }
        };

        match selector {
            RootSelector::MyTree => Ok(ROOT_ID.to_string()),
            RootSelector::Collection(name) => {
                let existing = with_retry(&self.retry, "list collections", move || {
                    dest.list_collections()
                })
                .await
                .map_err(root_error("list collections"))?;
                if let Some(collection) = existing.into_iter().find(|c| &c.name == name) {
                    tracing::info!(collection = %name, "reusing destination collection");
                    return Ok(collection.id);
                }
                let name = name.as_str();
                let id = with_retry(&self.retry, "create collection", move || {
                    dest.create_collection(name)
                })
                .await
                .map_err(root_error("create collection"))?;
                tracing::info!(collection = %name, "destination collection created");
                Ok(id)
            }
            RootSelector::SharedWithMe => {
                let (id, _) = folders
                    .find_or_create(dest, &self.retry, ROOT_ID, SHARED_WITH_ME_FOLDER)
                    .await
                    .map_err(root_error("create folder"))?;
                Ok(id)
            }
        }
    }
}

impl std::fmt::Debug for Migration<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("workspace", &self.workspace)
            .field("retry", &self.retry)
            .finish()
    }
}
