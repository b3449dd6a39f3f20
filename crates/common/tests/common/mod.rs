//! Shared fixtures for migration integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use common::ledger::{CheckpointStore, MemoryLedger};
use common::migrate::{download, ArchiveWriter, DownloadReport, MigrationContext, RootSelector};
use common::retry::RetryPolicy;
use common::store::{MemoryStore, ROOT_ID};

pub const DOCUMENT_MIME: &str = "application/vnd.google-apps.document";
pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const BEACH_JPG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3];

/// Ids of the interesting nodes in [`source_fixture`].
pub struct Fixture {
    pub store: MemoryStore,
    pub docs: String,
    pub results: String,
    pub plan: String,
    pub photos: String,
    pub beach: String,
    pub readme: String,
}

/// ```text
/// docs/
///   q3: results.txt
///   notes.md
///   plan            (document, exported as plan.docx)
/// photos/
///   2024/
///     beach.jpg
/// empty/
/// readme.txt
/// ```
pub fn source_fixture() -> Fixture {
    let store = MemoryStore::new();
    let docs = store.add_folder(ROOT_ID, "docs");
    let results = store.add_file(&docs, "q3: results.txt", "quarterly numbers");
    store.add_file(&docs, "notes.md", "- ship it");
    let plan = store.add_document(&docs, "plan", DOCUMENT_MIME);
    let photos = store.add_folder(ROOT_ID, "photos");
    let year = store.add_folder(&photos, "2024");
    let beach = store.add_file(&year, "beach.jpg", BEACH_JPG);
    store.add_folder(ROOT_ID, "empty");
    let readme = store.add_file(ROOT_ID, "readme.txt", "hello");

    Fixture {
        store,
        docs,
        results,
        plan,
        photos,
        beach,
        readme,
    }
}

/// What the fixture looks like once it has made it to a destination.
pub fn expected_tree() -> BTreeMap<String, Option<Bytes>> {
    let mut tree = BTreeMap::new();
    tree.insert("docs".to_string(), None);
    tree.insert(
        "docs/q3_ results.txt".to_string(),
        Some(Bytes::from("quarterly numbers")),
    );
    tree.insert("docs/notes.md".to_string(), Some(Bytes::from("- ship it")));
    tree.insert(
        "docs/plan.docx".to_string(),
        Some(Bytes::from(format!("plan as {}", DOCX_MIME))),
    );
    tree.insert("photos".to_string(), None);
    tree.insert("photos/2024".to_string(), None);
    tree.insert(
        "photos/2024/beach.jpg".to_string(),
        Some(Bytes::from_static(BEACH_JPG)),
    );
    tree.insert("empty".to_string(), None);
    tree.insert("readme.txt".to_string(), Some(Bytes::from("hello")));
    tree
}

pub fn context() -> MigrationContext {
    context_with(Arc::new(MemoryLedger::new()))
}

pub fn context_with(ledger: Arc<dyn CheckpointStore>) -> MigrationContext {
    MigrationContext::new(ledger).with_retry(RetryPolicy::immediate(5))
}

/// Download `selector` from `source` into a packed archive under `dir` and
/// unpack it. Returns the unpacked tree.
pub async fn stage(
    source: &MemoryStore,
    selector: RootSelector,
    dir: &Path,
    ctx: &mut MigrationContext,
) -> (PathBuf, DownloadReport) {
    let mut writer = ArchiveWriter::create(dir.join("staging.tar.gz")).unwrap();
    let report = download(source, &selector, &mut writer, ctx).await.unwrap();
    let staged = writer.pack(&ctx.index).unwrap();
    let tree = staged.unpack(&dir.join("extracted")).unwrap();
    (tree, report)
}

/// Logs from the engine, when RUST_LOG asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
