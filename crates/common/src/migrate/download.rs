//! Tree download
//!
//! Walks the source tree depth-first and streams every unit into the
//! staging archive. Folders become directory entries, binary files are
//! fetched as-is, workspace documents are exported through the export table,
//! and shortcuts are recorded for the shortcut pass. A shortcut whose target
//! the source principal owns is additionally copied inline, so the staged
//! tree is usable on its own.
//!
//! Content is spooled to an anonymous temp file per attempt, so a retried
//! download starts from a clean slate and the archive only ever sees whole
//! files.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::archive::ArchiveWriter;
use super::context::{MigrationContext, ShortcutRecord};
use super::error::{ItemFailure, MigrationError};
use crate::export::export_format;
use crate::path::{sanitize_name, split_extension, TreePath};
use crate::progress::Phase;
use crate::retry::{with_retry, RetryError};
use crate::store::{ContentStream, Node, NodeKind, RemoteStore, StoreError, ROOT_ID};

/// Which part of the source principal's view gets migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum RootSelector {
    /// The principal's own tree
    MyTree,
    /// A shared collection, by name
    Collection(String),
    /// Items other principals shared with this one
    SharedWithMe,
}

impl RootSelector {
    /// Stable, filesystem safe label used to key staging files and ledgers.
    pub fn label(&self) -> String {
        match self {
            RootSelector::MyTree => "my-tree".to_string(),
            RootSelector::Collection(name) => format!("collection-{}", sanitize_name(name)),
            RootSelector::SharedWithMe => "shared-with-me".to_string(),
        }
    }
}

impl fmt::Display for RootSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootSelector::MyTree => write!(f, "my tree"),
            RootSelector::Collection(name) => write!(f, "collection '{}'", name),
            RootSelector::SharedWithMe => write!(f, "shared with me"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReport {
    pub folders: u64,
    pub files: u64,
    pub exported: u64,
    /// Shortcuts recorded for the shortcut pass
    pub shortcuts: u64,
    /// Units that were skipped on purpose, e.g. documents with no export
    pub skipped: Vec<ItemFailure>,
    pub failed: Vec<ItemFailure>,
    /// Folders whose listing failed; nothing below them was staged
    pub incomplete_branches: Vec<ItemFailure>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.incomplete_branches.is_empty()
    }
}

/// Stream the tree selected by `selector` into `writer`.
///
/// Failing to enumerate the root aborts the run; any other failure is
/// recorded in the report and in `ctx.index`, and the walk continues.
pub async fn download(
    store: &dyn RemoteStore,
    selector: &RootSelector,
    writer: &mut ArchiveWriter,
    ctx: &mut MigrationContext,
) -> Result<DownloadReport, MigrationError> {
    let mut downloader = TreeDownloader {
        store,
        writer,
        ctx,
        report: DownloadReport::default(),
        ancestors: Vec::new(),
        completed: 0,
        total: 0,
    };
    downloader
        .run(selector)
        .instrument(tracing::info_span!("download", root = %selector))
        .await?;
    Ok(downloader.report)
}

/// What to fetch for a leaf.
#[derive(Clone, Copy)]
enum Fetch<'a> {
    Raw,
    Export(&'a str),
}

struct TreeDownloader<'a> {
    store: &'a dyn RemoteStore,
    writer: &'a mut ArchiveWriter,
    ctx: &'a mut MigrationContext,
    report: DownloadReport,
    /// Folder ids on the current path, for cycle detection
    ancestors: Vec<String>,
    completed: u64,
    total: u64,
}

impl<'a> TreeDownloader<'a> {
    async fn run(&mut self, selector: &RootSelector) -> Result<(), MigrationError> {
        let (root_id, children) = self.list_root(selector).await?;
        if let Some(root_id) = root_id {
            self.ancestors.push(root_id);
        }

        let mut stack = self.ancestors.clone();
        self.total = self.count_leaves(&children, &mut stack).await;
        tracing::info!(total = self.total, "source tree enumerated");

        self.visit_all(children, TreePath::root(), true).await
    }

    async fn list_root(
        &self,
        selector: &RootSelector,
    ) -> Result<(Option<String>, Vec<Node>), MigrationError> {
        let root_error = |source| MigrationError::Listing {
            path: TreePath::root(),
            source,
        };
        let store = self.store;
        match selector {
            RootSelector::MyTree => {
                let children = self.list(ROOT_ID).await.map_err(root_error)?;
                Ok((Some(ROOT_ID.to_string()), children))
            }
            RootSelector::Collection(name) => {
                let collections = with_retry(&self.ctx.retry, "list collections", move || {
                    store.list_collections()
                })
                .await
                .map_err(root_error)?;
                let collection = collections
                    .into_iter()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| MigrationError::CollectionNotFound(name.clone()))?;
                let children = self.list(&collection.id).await.map_err(root_error)?;
                Ok((Some(collection.id), children))
            }
            RootSelector::SharedWithMe => {
                let children = with_retry(&self.ctx.retry, "list shared", move || {
                    store.list_shared_with_me()
                })
                .await
                .map_err(root_error)?;
                Ok((None, children))
            }
        }
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<Node>, RetryError> {
        let store = self.store;
        with_retry(&self.ctx.retry, "list children", move || {
            store.list_children(folder_id)
        })
        .await
    }

    /// Leaf count for progress totals. A listing that fails here is only
    /// logged; the walk itself reports it.
    fn count_leaves<'b>(
        &'b self,
        nodes: &'b [Node],
        stack: &'b mut Vec<String>,
    ) -> BoxFuture<'b, u64> {
        async move {
            let mut total = 0;
            for node in nodes {
                let folder_id = match node.kind() {
                    NodeKind::Folder => Some(node.id.as_str()),
                    NodeKind::Shortcut => node
                        .shortcut_target
                        .as_ref()
                        .filter(|t| {
                            t.owned_by_me && NodeKind::from_mime(&t.mime_type) == NodeKind::Folder
                        })
                        .map(|t| t.id.as_str()),
                    _ => None,
                };
                let Some(folder_id) = folder_id else {
                    total += 1;
                    continue;
                };
                if stack.iter().any(|id| id == folder_id) {
                    continue;
                }
                match self.list(folder_id).await {
                    Ok(children) => {
                        stack.push(folder_id.to_string());
                        total += self.count_leaves(&children, stack).await;
                        stack.pop();
                    }
                    Err(err) => {
                        tracing::warn!(folder = %node.name, error = %err, "could not count folder")
                    }
                }
            }
            total
        }
        .boxed()
    }

    fn visit_all(
        &mut self,
        mut children: Vec<Node>,
        path: TreePath,
        canonical: bool,
    ) -> BoxFuture<'_, Result<(), MigrationError>> {
        async move {
            children.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
            let mut used = HashSet::new();

            for node in children {
                self.ctx.check_cancelled()?;
                match self.visit(node, &path, canonical, &mut used).await {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(MigrationError::Listing { path, source }) => {
                        tracing::error!(folder = %path, error = %source, "branch could not be listed");
                        self.ctx.index.mark_failed(&path);
                        self.report
                            .incomplete_branches
                            .push(ItemFailure::new(path, source));
                    }
                    Err(MigrationError::Remote { path, source, .. }) => {
                        self.ctx.index.mark_failed(&path);
                        self.report.failed.push(ItemFailure::new(path, source));
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn visit(
        &mut self,
        node: Node,
        parent: &TreePath,
        canonical: bool,
        used: &mut HashSet<String>,
    ) -> Result<(), MigrationError> {
        match node.kind() {
            NodeKind::Folder => {
                let path = unique_child(parent, &node.name, used);
                self.descend(&node.id, path, canonical).await
            }
            NodeKind::Shortcut => self.visit_shortcut(node, parent, canonical, used).await,
            NodeKind::File | NodeKind::WorkspaceDocument => {
                let result = self.fetch_leaf(&node, parent, canonical, used).await;
                self.advance(&node.name);
                result
            }
        }
    }

    async fn descend(
        &mut self,
        folder_id: &str,
        path: TreePath,
        canonical: bool,
    ) -> Result<(), MigrationError> {
        if self.ancestors.iter().any(|id| id == folder_id) {
            tracing::warn!(folder = %path, "folder cycle, not descending");
            return Ok(());
        }

        let children = self
            .list(folder_id)
            .await
            .map_err(|source| MigrationError::Listing {
                path: path.clone(),
                source,
            })?;

        self.writer.add_dir(&path)?;
        self.report.folders += 1;
        if canonical {
            self.ctx.index.paths.insert(path.clone(), folder_id.to_string());
        }
        tracing::debug!(folder = %path, children = children.len(), "descending");

        self.ancestors.push(folder_id.to_string());
        let result = self.visit_all(children, path, canonical).await;
        self.ancestors.pop();
        result
    }

    async fn visit_shortcut(
        &mut self,
        node: Node,
        parent: &TreePath,
        canonical: bool,
        used: &mut HashSet<String>,
    ) -> Result<(), MigrationError> {
        let Some(target) = node.shortcut_target.clone() else {
            tracing::warn!(shortcut = %node.name, "shortcut has no target, skipping");
            self.report
                .skipped
                .push(ItemFailure::new(parent.child(&node.name), "shortcut without target"));
            self.advance(&node.name);
            return Ok(());
        };

        if canonical {
            self.ctx.index.shortcuts.push(ShortcutRecord {
                shortcut_id: node.id.clone(),
                target_id: target.id.clone(),
                parent: parent.clone(),
                name: sanitize_name(&node.name),
            });
            self.report.shortcuts += 1;
        }

        if !target.owned_by_me {
            tracing::debug!(shortcut = %node.name, "target owned elsewhere, recorded only");
            self.advance(&node.name);
            return Ok(());
        }

        let inline = Node {
            id: target.id,
            name: node.name,
            mime_type: target.mime_type,
            parent: node.parent,
            owned_by_me: true,
            shortcut_target: None,
        };
        match inline.kind() {
            NodeKind::Folder => {
                let path = unique_child(parent, &inline.name, used);
                self.descend(&inline.id, path, false).await
            }
            NodeKind::Shortcut => {
                tracing::debug!(shortcut = %inline.name, "not following shortcut to shortcut");
                self.advance(&inline.name);
                Ok(())
            }
            NodeKind::File | NodeKind::WorkspaceDocument => {
                let result = self.fetch_leaf(&inline, parent, false, used).await;
                self.advance(&inline.name);
                result
            }
        }
    }

    async fn fetch_leaf(
        &mut self,
        node: &Node,
        parent: &TreePath,
        canonical: bool,
        used: &mut HashSet<String>,
    ) -> Result<(), MigrationError> {
        let (fetch, file_name) = if node.kind() == NodeKind::WorkspaceDocument {
            match export_format(&node.mime_type) {
                Some(format) => (
                    Fetch::Export(format.content_type),
                    format!("{}{}", node.name, format.extension),
                ),
                None => {
                    tracing::warn!(
                        name = %node.name,
                        mime_type = %node.mime_type,
                        "document type has no export format, skipping"
                    );
                    self.report.skipped.push(ItemFailure::new(
                        parent.child(&node.name),
                        format!("no export format for {}", node.mime_type),
                    ));
                    return Ok(());
                }
            }
        } else {
            (Fetch::Raw, node.name.clone())
        };

        let path = unique_child(parent, &file_name, used);
        let (file, size) = self.fetch(&node.id, fetch, &path).await?;
        self.writer.add_file(&path, size, file)?;

        if canonical {
            self.ctx.index.paths.insert(path.clone(), node.id.clone());
        }
        match fetch {
            Fetch::Raw => self.report.files += 1,
            Fetch::Export(_) => self.report.exported += 1,
        }
        tracing::info!(path = %path, bytes = size, "staged");
        Ok(())
    }

    async fn fetch(
        &self,
        node_id: &str,
        fetch: Fetch<'_>,
        path: &TreePath,
    ) -> Result<(File, u64), MigrationError> {
        let store = self.store;
        let operation = match fetch {
            Fetch::Raw => "download",
            Fetch::Export(_) => "export",
        };
        with_retry(&self.ctx.retry, operation, move || async move {
            let stream = match fetch {
                Fetch::Raw => store.get_content(node_id).await?,
                Fetch::Export(target) => store.export_content(node_id, target).await?,
            };
            spool(stream).await
        })
        .await
        .map_err(|source| {
            tracing::error!(path = %path, error = %source, "fetch failed");
            MigrationError::Remote {
                operation,
                path: path.clone(),
                source,
            }
        })
    }

    fn advance(&mut self, item: &str) {
        self.completed += 1;
        self.ctx
            .notify(item, Phase::Downloading, self.completed, self.total);
    }
}

/// Drain a content stream into an anonymous temp file, rewound for reading.
async fn spool(mut stream: ContentStream) -> Result<(File, u64), StoreError> {
    let mut file = tempfile::tempfile().map_err(StoreError::local)?;
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).map_err(StoreError::local)?;
        size += chunk.len() as u64;
    }
    file.seek(SeekFrom::Start(0)).map_err(StoreError::local)?;
    Ok((file, size))
}

/// Sanitized child path, suffixed ` (n)` before the extension when a sibling
/// already took the name.
fn unique_child(parent: &TreePath, raw_name: &str, used: &mut HashSet<String>) -> TreePath {
    let name = sanitize_name(raw_name);
    if used.insert(name.clone()) {
        return parent.join_staged(&name);
    }

    let (stem, extension) = split_extension(&name);
    let mut n = 2;
    loop {
        let candidate = format!("{} ({}){}", stem, n, extension);
        if used.insert(candidate.clone()) {
            tracing::debug!(name = %raw_name, renamed = %candidate, "sibling name collision");
            return parent.join_staged(&candidate);
        }
        n += 1;
    }
}
