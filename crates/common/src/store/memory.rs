use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use super::{
    Collection, ContentStream, Node, NodeKind, Permission, RemoteStore, ShortcutTarget,
    StoreError, FOLDER_MIME, ROOT_ID, SHORTCUT_MIME,
};

/// Operations a [`MemoryStore`] counts and can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListChildren,
    ListSharedWithMe,
    GetContent,
    ExportContent,
    CreateFolder,
    CreateFile,
    CreateShortcut,
    ListPermissions,
    CreatePermission,
    ListCollections,
    CreateCollection,
}

/// In-memory store keyed by generated ids.
///
/// Faults are keyed by `(op, subject)` where the subject is the id the call
/// is about (parent id for listings, node id for reads and permissions) or
/// the name for create calls.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug)]
struct StoredNode {
    node: Node,
    content: Option<Bytes>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    nodes: BTreeMap<String, StoredNode>,
    /// parent id -> child ids, in insertion order
    children: HashMap<String, Vec<String>>,
    permissions: HashMap<String, Vec<Permission>>,
    collections: Vec<Collection>,
    shared_with_me: Vec<String>,
    faults: HashMap<(StoreOp, String), VecDeque<StoreError>>,
    calls: HashMap<StoreOp, usize>,
    notifications: usize,
    next_id: u64,
}

impl MemoryStoreInner {
    fn record_call(&mut self, op: StoreOp, subject: &str) -> Result<(), StoreError> {
        *self.calls.entry(op).or_insert(0) += 1;
        let key = (op, subject.to_string());
        if let Some(queue) = self.faults.get_mut(&key) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn insert(&mut self, parent: &str, node: Node, content: Option<Bytes>) -> String {
        let id = node.id.clone();
        self.children
            .entry(parent.to_string())
            .or_default()
            .push(id.clone());
        self.nodes.insert(id.clone(), StoredNode { node, content });
        id
    }

    fn is_container(&self, id: &str) -> bool {
        id == ROOT_ID
            || self.collections.iter().any(|c| c.id == id)
            || self
                .nodes
                .get(id)
                .map(|n| n.node.kind() == NodeKind::Folder)
                .unwrap_or(false)
    }

    fn new_node(&mut self, parent: &str, name: &str, mime_type: &str) -> Node {
        Node {
            id: self.allocate_id("node"),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            parent: Some(parent.to_string()),
            owned_by_me: true,
            shortcut_target: None,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner::default())),
        }
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        let mut inner = self.inner.lock();
        let node = inner.new_node(parent, name, FOLDER_MIME);
        inner.insert(parent, node, None)
    }

    pub fn add_file(&self, parent: &str, name: &str, content: impl Into<Bytes>) -> String {
        let mut inner = self.inner.lock();
        let mime = mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string();
        let node = inner.new_node(parent, name, &mime);
        inner.insert(parent, node, Some(content.into()))
    }

    /// Add a live document of kind `mime_type`; exports render as
    /// `"<name> as <target type>"`.
    pub fn add_document(&self, parent: &str, name: &str, mime_type: &str) -> String {
        let mut inner = self.inner.lock();
        let node = inner.new_node(parent, name, mime_type);
        inner.insert(parent, node, None)
    }

    pub fn add_shortcut(&self, parent: &str, name: &str, target_id: &str) -> String {
        let mut inner = self.inner.lock();
        let target = inner.nodes.get(target_id).map(|t| ShortcutTarget {
            id: target_id.to_string(),
            mime_type: t.node.mime_type.clone(),
            owned_by_me: t.node.owned_by_me,
        });
        let mut node = inner.new_node(parent, name, SHORTCUT_MIME);
        node.shortcut_target = target;
        inner.insert(parent, node, None)
    }

    /// Mark a node as owned by somebody else.
    pub fn set_foreign(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.nodes.get_mut(id) {
            stored.node.owned_by_me = false;
        }
        for stored in inner.nodes.values_mut() {
            if let Some(target) = stored.node.shortcut_target.as_mut() {
                if target.id == id {
                    target.owned_by_me = false;
                }
            }
        }
    }

    pub fn share_with_me(&self, id: &str) {
        self.inner.lock().shared_with_me.push(id.to_string());
    }

    pub fn add_collection(&self, name: &str) -> String {
        let mut inner = self.inner.lock();
        let id = inner.allocate_id("collection");
        inner.collections.push(Collection {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    pub fn add_permission(&self, id: &str, permission: Permission) {
        self.inner
            .lock()
            .permissions
            .entry(id.to_string())
            .or_default()
            .push(permission);
    }

    /// Make the next `times` calls of `op` on `subject` fail with `error`.
    pub fn fail(&self, op: StoreOp, subject: &str, error: StoreError, times: usize) {
        let mut inner = self.inner.lock();
        let queue = inner.faults.entry((op, subject.to_string())).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn permissions(&self, id: &str) -> Vec<Permission> {
        self.inner
            .lock()
            .permissions
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notifications_sent(&self) -> usize {
        self.inner.lock().notifications
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.inner.lock().nodes.get(id).map(|n| n.node.clone())
    }

    /// Find a direct child by name.
    pub fn find_child(&self, parent: &str, name: &str) -> Option<Node> {
        let inner = self.inner.lock();
        inner.children.get(parent).and_then(|ids| {
            ids.iter()
                .filter_map(|id| inner.nodes.get(id))
                .find(|n| n.node.name == name)
                .map(|n| n.node.clone())
        })
    }

    /// Snapshot of the tree under `root`: every folder maps to `None`, every
    /// other node to its stored content.
    pub fn snapshot(&self, root: &str) -> BTreeMap<String, Option<Bytes>> {
        let inner = self.inner.lock();
        let mut out = BTreeMap::new();
        let mut stack = vec![(root.to_string(), String::new())];
        while let Some((id, prefix)) = stack.pop() {
            for child_id in inner.children.get(&id).into_iter().flatten() {
                let Some(child) = inner.nodes.get(child_id) else {
                    continue;
                };
                let path = if prefix.is_empty() {
                    child.node.name.clone()
                } else {
                    format!("{}/{}", prefix, child.node.name)
                };
                if child.node.kind() == NodeKind::Folder {
                    out.insert(path.clone(), None);
                    stack.push((child_id.clone(), path));
                } else {
                    out.insert(path, child.content.clone());
                }
            }
        }
        out
    }

    fn content_stream(bytes: Bytes) -> ContentStream {
        // Hand the content out in small chunks so consumers exercise streaming.
        let chunks: Vec<Result<Bytes, StoreError>> = bytes
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Node>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::ListChildren, parent_id)?;
        if !inner.is_container(parent_id) {
            return Err(StoreError::NotFound(format!("folder {}", parent_id)));
        }
        Ok(inner
            .children
            .get(parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.nodes.get(id))
            .map(|n| n.node.clone())
            .collect())
    }

    async fn list_shared_with_me(&self) -> Result<Vec<Node>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::ListSharedWithMe, "")?;
        Ok(inner
            .shared_with_me
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .map(|n| n.node.clone())
            .collect())
    }

    async fn get_content(&self, node_id: &str) -> Result<ContentStream, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::GetContent, node_id)?;
        let stored = inner
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(node_id.to_string()))?;
        let content = stored.content.clone().ok_or_else(|| {
            StoreError::InvalidRequest(format!("{} has no binary content", stored.node.name))
        })?;
        Ok(Self::content_stream(content))
    }

    async fn export_content(
        &self,
        node_id: &str,
        target_type: &str,
    ) -> Result<ContentStream, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::ExportContent, node_id)?;
        let stored = inner
            .nodes
            .get(node_id)
            .ok_or_else(|| StoreError::NotFound(node_id.to_string()))?;
        if stored.node.kind() != NodeKind::WorkspaceDocument {
            return Err(StoreError::InvalidRequest(format!(
                "{} is not exportable",
                stored.node.name
            )));
        }
        let rendered = format!("{} as {}", stored.node.name, target_type);
        Ok(Self::content_stream(Bytes::from(rendered)))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::CreateFolder, name)?;
        if !inner.is_container(parent_id) {
            return Err(StoreError::NotFound(format!("folder {}", parent_id)));
        }
        let node = inner.new_node(parent_id, name, FOLDER_MIME);
        Ok(inner.insert(parent_id, node, None))
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &Path,
    ) -> Result<String, StoreError> {
        let content = tokio::fs::read(content).await.map_err(StoreError::local)?;
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::CreateFile, name)?;
        if !inner.is_container(parent_id) {
            return Err(StoreError::NotFound(format!("folder {}", parent_id)));
        }
        let mime = mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string();
        let node = inner.new_node(parent_id, name, &mime);
        Ok(inner.insert(parent_id, node, Some(Bytes::from(content))))
    }

    async fn create_shortcut(
        &self,
        parent_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::CreateShortcut, name)?;
        let target = inner
            .nodes
            .get(target_id)
            .map(|t| ShortcutTarget {
                id: target_id.to_string(),
                mime_type: t.node.mime_type.clone(),
                owned_by_me: t.node.owned_by_me,
            })
            .ok_or_else(|| StoreError::NotFound(target_id.to_string()))?;
        let mut node = inner.new_node(parent_id, name, SHORTCUT_MIME);
        node.shortcut_target = Some(target);
        Ok(inner.insert(parent_id, node, None))
    }

    async fn list_permissions(&self, node_id: &str) -> Result<Vec<Permission>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::ListPermissions, node_id)?;
        Ok(inner.permissions.get(node_id).cloned().unwrap_or_default())
    }

    async fn create_permission(
        &self,
        node_id: &str,
        permission: &Permission,
        notify: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::CreatePermission, node_id)?;
        if notify {
            inner.notifications += 1;
        }
        inner
            .permissions
            .entry(node_id.to_string())
            .or_default()
            .push(permission.clone());
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::ListCollections, "")?;
        Ok(inner.collections.clone())
    }

    async fn create_collection(&self, name: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        inner.record_call(StoreOp::CreateCollection, name)?;
        let id = inner.allocate_id("collection");
        inner.collections.push(Collection {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(stream: ContentStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_faults_fire_then_clear() {
        let store = MemoryStore::new();
        let id = store.add_file(ROOT_ID, "a.txt", "hello world");
        store.fail(
            StoreOp::GetContent,
            &id,
            StoreError::Network("reset".into()),
            2,
        );

        assert!(store.get_content(&id).await.is_err());
        assert!(store.get_content(&id).await.is_err());
        let content = collect(store.get_content(&id).await.unwrap()).await;
        assert_eq!(content, b"hello world");
        assert_eq!(store.calls(StoreOp::GetContent), 3);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_tree() {
        let store = MemoryStore::new();
        let docs = store.add_folder(ROOT_ID, "docs");
        store.add_file(&docs, "a.txt", "a");
        store.add_folder(&docs, "empty");

        let snapshot = store.snapshot(ROOT_ID);
        assert_eq!(snapshot.get("docs"), Some(&None));
        assert_eq!(snapshot.get("docs/empty"), Some(&None));
        assert_eq!(snapshot.get("docs/a.txt"), Some(&Some(Bytes::from("a"))));
    }

    #[tokio::test]
    async fn test_created_file_holds_local_content() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("notes.md");
        std::fs::write(&local, "- ship it").unwrap();
        let store = MemoryStore::new();

        let id = store.create_file(ROOT_ID, "notes.md", &local).await.unwrap();

        let content = collect(store.get_content(&id).await.unwrap()).await;
        assert_eq!(content, b"- ship it");
        let missing = store
            .create_file(ROOT_ID, "gone.md", &dir.path().join("gone.md"))
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::Local(_)));
    }

    #[tokio::test]
    async fn test_listing_unknown_folder_is_not_found() {
        let store = MemoryStore::new();
        let err = store.list_children("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
