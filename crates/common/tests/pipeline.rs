//! End-to-end migration runs between two in-memory stores

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::common::migrate::{DomainMapping, Migration, MigrationPlan, RootSelector, Workspace};
use ::common::progress::{CancelFlag, ChannelObserver, Phase};
use ::common::retry::RetryPolicy;
use ::common::store::{
    Collection, ContentStream, MemoryStore, Node, NodeKind, Permission, RemoteStore, Role,
    StoreError, StoreOp, ROOT_ID,
};
use async_trait::async_trait;
use tempfile::TempDir;

fn plan(selector: RootSelector) -> MigrationPlan {
    MigrationPlan::new("ana@old.example", "ana@new.example", selector)
}

fn migration<'a>(source: &'a MemoryStore, dest: &'a MemoryStore, state: &TempDir) -> Migration<'a> {
    Migration::new(source, dest, Workspace::new(state.path())).with_retry(RetryPolicy::immediate(5))
}

#[tokio::test]
async fn test_full_run_copies_tree_and_cleans_up() {
    common::init_tracing();
    let fixture = common::source_fixture();
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);
    let migration = migration(&fixture.store, &dest, &state);

    let report = migration.run(&plan).await.unwrap();

    assert!(report.is_complete());
    let download = report.download.as_ref().unwrap();
    assert_eq!(download.files, 4);
    assert_eq!(download.exported, 1);
    assert_eq!(report.upload.files_created, 5);
    assert_eq!(dest.snapshot(ROOT_ID), common::expected_tree());

    let workspace = migration.workspace();
    assert!(report.staging_removed);
    assert!(!workspace.archive_path(&plan).exists());
    assert!(!workspace.extract_dir(&plan).exists());
    assert!(workspace.ledger_path(&plan).exists());
    assert!(workspace.id_journal_path(&plan).exists());
}

#[tokio::test]
async fn test_keep_staging_leaves_archive_behind() {
    let fixture = common::source_fixture();
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree).keep_staging(true);
    let migration = migration(&fixture.store, &dest, &state);

    let report = migration.run(&plan).await.unwrap();

    assert!(report.is_complete());
    assert!(!report.staging_removed);
    assert!(migration.workspace().archive_path(&plan).exists());
    assert!(migration
        .workspace()
        .extract_dir(&plan)
        .join("photos/2024/beach.jpg")
        .is_file());
}

#[tokio::test]
async fn test_rerun_uploads_nothing_new() {
    let fixture = common::source_fixture();
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);
    let migration = migration(&fixture.store, &dest, &state);

    migration.run(&plan).await.unwrap();
    let files = dest.calls(StoreOp::CreateFile);
    let folders = dest.calls(StoreOp::CreateFolder);

    let report = migration.run(&plan).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.upload.files_created, 0);
    assert_eq!(report.upload.skipped_existing, 4);
    assert_eq!(dest.calls(StoreOp::CreateFile), files);
    assert_eq!(dest.calls(StoreOp::CreateFolder), folders);
    assert_eq!(dest.snapshot(ROOT_ID), common::expected_tree());
}

#[tokio::test]
async fn test_restart_reuses_packed_archive() {
    let fixture = common::source_fixture();
    let dest = MemoryStore::new();
    dest.fail(
        StoreOp::CreateFile,
        "readme.txt",
        StoreError::Unauthenticated("token expired".into()),
        1,
    );
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);
    let migration = migration(&fixture.store, &dest, &state);

    let err = migration.run(&plan).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(migration.workspace().archive_path(&plan).exists());
    let downloads = fixture.store.calls(StoreOp::GetContent);
    let exports = fixture.store.calls(StoreOp::ExportContent);

    let report = migration.run(&plan).await.unwrap();

    assert!(report.is_complete());
    assert!(report.download.is_none());
    assert_eq!(fixture.store.calls(StoreOp::GetContent), downloads);
    assert_eq!(fixture.store.calls(StoreOp::ExportContent), exports);
    // docs, empty and photos finished before the abort
    assert_eq!(report.upload.skipped_existing, 3);
    assert_eq!(report.upload.files_created, 1);
    assert_eq!(dest.snapshot(ROOT_ID), common::expected_tree());
}

#[tokio::test]
async fn test_incomplete_download_is_not_reused() {
    let fixture = common::source_fixture();
    fixture.store.fail(
        StoreOp::GetContent,
        &fixture.beach,
        StoreError::Network("reset".into()),
        5,
    );
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);
    let migration = migration(&fixture.store, &dest, &state);

    let first = migration.run(&plan).await.unwrap();
    assert!(!first.is_complete());
    assert!(!first.staging_removed);
    assert!(dest.find_child(ROOT_ID, "readme.txt").is_some());

    let second = migration.run(&plan).await.unwrap();

    assert!(second.is_complete());
    assert!(second.download.is_some());
    assert_eq!(second.upload.files_created, 1);
    assert_eq!(dest.snapshot(ROOT_ID), common::expected_tree());
}

#[tokio::test]
async fn test_shortcuts_point_at_migrated_copies() {
    let fixture = common::source_fixture();
    let link = fixture
        .store
        .add_shortcut(&fixture.docs, "beach link", &fixture.beach);
    let outside = fixture.store.add_file("someone-else", "theirs.txt", "x");
    fixture.store.set_foreign(&outside);
    fixture
        .store
        .add_shortcut(ROOT_ID, "their file", &outside);
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);
    let migration = migration(&fixture.store, &dest, &state);

    let report = migration.run(&plan).await.unwrap();

    assert_eq!(report.shortcuts.created, 1);
    assert_eq!(report.shortcuts.unresolved, 1);
    assert!(report.is_complete());

    let photos = dest.find_child(ROOT_ID, "photos").unwrap();
    let year = dest.find_child(&photos.id, "2024").unwrap();
    let beach = dest.find_child(&year.id, "beach.jpg").unwrap();
    let docs = dest.find_child(ROOT_ID, "docs").unwrap();
    let shortcut = dest
        .list_children(&docs.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.kind() == NodeKind::Shortcut)
        .unwrap();
    assert_eq!(shortcut.name, "beach link");
    assert_ne!(shortcut.id, link);
    assert_eq!(shortcut.shortcut_target.unwrap().id, beach.id);

    // the shortcut is ledgered, a second run does not duplicate it
    let again = migration.run(&plan).await.unwrap();
    assert_eq!(again.shortcuts.created, 0);
    assert_eq!(again.shortcuts.existing, 1);
    assert_eq!(dest.calls(StoreOp::CreateShortcut), 1);
}

/// Destination whose upload of one file name never finishes, so a run can
/// be dropped mid-upload the way a killed process would stop.
#[derive(Debug)]
struct StallingStore {
    inner: MemoryStore,
    stall_on: &'static str,
}

#[async_trait]
impl RemoteStore for StallingStore {
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Node>, StoreError> {
        self.inner.list_children(parent_id).await
    }

    async fn list_shared_with_me(&self) -> Result<Vec<Node>, StoreError> {
        self.inner.list_shared_with_me().await
    }

    async fn get_content(&self, node_id: &str) -> Result<ContentStream, StoreError> {
        self.inner.get_content(node_id).await
    }

    async fn export_content(
        &self,
        node_id: &str,
        target_type: &str,
    ) -> Result<ContentStream, StoreError> {
        self.inner.export_content(node_id, target_type).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        self.inner.create_folder(parent_id, name).await
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &Path,
    ) -> Result<String, StoreError> {
        if name == self.stall_on {
            return std::future::pending().await;
        }
        self.inner.create_file(parent_id, name, content).await
    }

    async fn create_shortcut(
        &self,
        parent_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<String, StoreError> {
        self.inner.create_shortcut(parent_id, name, target_id).await
    }

    async fn list_permissions(&self, node_id: &str) -> Result<Vec<Permission>, StoreError> {
        self.inner.list_permissions(node_id).await
    }

    async fn create_permission(
        &self,
        node_id: &str,
        permission: &Permission,
        notify: bool,
    ) -> Result<(), StoreError> {
        self.inner
            .create_permission(node_id, permission, notify)
            .await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        self.inner.list_collections().await
    }

    async fn create_collection(&self, name: &str) -> Result<String, StoreError> {
        self.inner.create_collection(name).await
    }
}

#[tokio::test]
async fn test_shortcuts_resolve_after_crash_mid_upload() {
    let fixture = common::source_fixture();
    fixture
        .store
        .add_shortcut(&fixture.docs, "beach link", &fixture.beach);
    let dest = MemoryStore::new();
    let stalling = StallingStore {
        inner: dest.clone(),
        stall_on: "readme.txt",
    };
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree);

    // readme.txt sorts last, so docs and photos are ledgered when it hangs
    let crashed = Migration::new(&fixture.store, &stalling, Workspace::new(state.path()))
        .with_retry(RetryPolicy::immediate(5));
    let outcome = tokio::time::timeout(Duration::from_secs(5), crashed.run(&plan)).await;
    assert!(outcome.is_err());
    drop(crashed);
    assert!(dest.find_child(ROOT_ID, "readme.txt").is_none());

    let report = migration(&fixture.store, &dest, &state)
        .run(&plan)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert!(report.download.is_none());
    assert_eq!(report.upload.files_created, 1);
    assert_eq!(report.shortcuts.created, 1);
    assert_eq!(report.shortcuts.unresolved, 0);

    let photos = dest.find_child(ROOT_ID, "photos").unwrap();
    let year = dest.find_child(&photos.id, "2024").unwrap();
    let beach = dest.find_child(&year.id, "beach.jpg").unwrap();
    let docs = dest.find_child(ROOT_ID, "docs").unwrap();
    let shortcut = dest
        .list_children(&docs.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.kind() == NodeKind::Shortcut)
        .unwrap();
    assert_eq!(shortcut.shortcut_target.unwrap().id, beach.id);
}

#[tokio::test]
async fn test_collection_lands_in_collection_of_same_name() {
    let source = MemoryStore::new();
    let team = source.add_collection("Team");
    let specs = source.add_folder(&team, "specs");
    source.add_file(&specs, "api.md", "v2");
    source.add_file(&team, "roadmap.txt", "q4");
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::Collection("Team".into()));

    let report = migration(&source, &dest, &state).run(&plan).await.unwrap();
    assert!(report.is_complete());

    let collections = dest.list_collections().await.unwrap();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].name, "Team");
    let tree = dest.snapshot(&collections[0].id);
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.get("specs"), Some(&None));
    assert!(tree.contains_key("specs/api.md"));
    assert!(tree.contains_key("roadmap.txt"));
}

#[tokio::test]
async fn test_existing_destination_collection_is_reused() {
    let source = MemoryStore::new();
    let team = source.add_collection("Team");
    source.add_file(&team, "roadmap.txt", "q4");
    let dest = MemoryStore::new();
    let existing = dest.add_collection("Team");
    let state = TempDir::new().unwrap();

    migration(&source, &dest, &state)
        .run(&plan(RootSelector::Collection("Team".into())))
        .await
        .unwrap();

    assert_eq!(dest.calls(StoreOp::CreateCollection), 0);
    assert!(dest.find_child(&existing, "roadmap.txt").is_some());
}

#[tokio::test]
async fn test_shared_items_land_in_their_own_folder() {
    let source = MemoryStore::new();
    let inbox = source.add_folder(ROOT_ID, "inbox");
    let note = source.add_file(&inbox, "from bo.txt", "hi");
    let board = source.add_folder(ROOT_ID, "board");
    source.add_file(&board, "minutes.txt", "none");
    source.share_with_me(&note);
    source.share_with_me(&board);
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();

    let report = migration(&source, &dest, &state)
        .run(&plan(RootSelector::SharedWithMe))
        .await
        .unwrap();

    assert!(report.is_complete());
    let shared = dest.find_child(ROOT_ID, "Shared with me").unwrap();
    assert_eq!(shared.kind(), NodeKind::Folder);
    let tree = dest.snapshot(&shared.id);
    assert!(tree.contains_key("from bo.txt"));
    assert!(tree.contains_key("board/minutes.txt"));
    assert!(dest.find_child(ROOT_ID, "inbox").is_none());
}

#[tokio::test]
async fn test_permissions_are_rewritten_into_target_domain() {
    let fixture = common::source_fixture();
    fixture.store.add_permission(
        &fixture.photos,
        Permission::user("bo@old.example", Role::Writer),
    );
    fixture.store.add_permission(
        &fixture.beach,
        Permission::user("guest@elsewhere.example", Role::Reader),
    );
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let plan = plan(RootSelector::MyTree)
        .with_domains(DomainMapping::new("old.example", "new.example"));

    let report = migration(&fixture.store, &dest, &state)
        .run(&plan)
        .await
        .unwrap();

    assert_eq!(report.upload.permissions.created, 1);
    assert_eq!(report.upload.permissions.skipped, 1);
    let photos = dest.find_child(ROOT_ID, "photos").unwrap();
    assert_eq!(
        dest.permissions(&photos.id),
        vec![Permission::user("bo@new.example", Role::Writer)]
    );
    assert_eq!(dest.notifications_sent(), 0);
}

#[tokio::test]
async fn test_progress_and_cancellation() {
    let fixture = common::source_fixture();
    let dest = MemoryStore::new();
    let state = TempDir::new().unwrap();
    let (observer, events) = ChannelObserver::new();
    let migration = migration(&fixture.store, &dest, &state).with_observer(Arc::new(observer));

    migration.run(&plan(RootSelector::MyTree)).await.unwrap();
    let last = events.latest().unwrap();
    assert_eq!(last.phase, Phase::Uploading);
    assert_eq!(last.completed, 5);
    assert_eq!(last.total, 5);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let other = MemoryStore::new();
    let err = Migration::new(&fixture.store, &other, Workspace::new(state.path().join("b")))
        .with_cancel(cancel)
        .run(&plan(RootSelector::MyTree))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(other.snapshot(ROOT_ID).is_empty());
}
