//! Tree migration
//!
//! One run moves a tree from a source store to a destination store:
//!
//! ```text
//!  source ──download──> ArchiveWriter ──pack──> StagedArchive (tar.gz + index)
//!                                                   │
//!                                                 unpack
//!                                                   v
//!  dest  <──upload── staging dir ──(ledger, folder cache, permissions)
//!    ^
//!    └──── shortcut pass (needs the complete id mapping)
//! ```
//!
//! Every stage runs sequentially and receives the same [`MigrationContext`],
//! which owns the state one run builds up: the path index and shortcut
//! records from the download, the id mapping from the upload, and handles to
//! the ledger, retry policy, observer and cancel flag.

mod archive;
mod context;
mod download;
mod error;
mod permissions;
mod pipeline;
mod shortcuts;
mod upload;

pub use archive::{ArchiveError, ArchiveWriter, StagedArchive, StagedIndex};
pub use context::{IdMapping, MigrationContext, ShortcutRecord};
pub use download::{download, DownloadReport, RootSelector};
pub use error::{ItemFailure, MigrationError};
pub use permissions::{DomainMapping, PermissionMigrator, PermissionReport};
pub use pipeline::{Migration, MigrationPlan, MigrationReport, Workspace};
pub use shortcuts::{resolve_shortcuts, ShortcutReport};
pub use upload::{upload, FolderCache, UploadReport};
