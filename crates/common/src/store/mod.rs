//! Remote document stores
//!
//! The engine never talks to a concrete service directly. Everything it needs
//! from a source or destination is expressed by [`RemoteStore`]:
//!
//! - **listing**: children of a folder, shared collections, the flat
//!   "shared with me" set
//! - **reading**: raw content, or an export of a workspace document into a
//!   static format
//! - **writing**: folders, files, shortcuts, collections
//! - **sharing**: permission entries on a node
//!
//! Implementations:
//! - [`DriveStore`]: the Drive v3 REST API over `reqwest`
//! - [`MemoryStore`]: an in-process store with fault injection, used by tests
//!
//! Failures are reported as [`StoreError`], whose variants carry the
//! classification the retry policy relies on.

mod drive;
mod memory;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use drive::{DriveConfig, DriveStore};
pub use memory::{MemoryStore, StoreOp};

/// Alias every store understands for the principal's own tree root.
pub const ROOT_ID: &str = "root";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";
pub const WORKSPACE_MIME_PREFIX: &str = "application/vnd.google-apps.";

/// Chunked byte content of a node.
pub type ContentStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection reset, timeout, DNS, truncated body
    #[error("network error: {0}")]
    Network(String),
    /// The service asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Remote 5xx
    #[error("service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    /// Credentials were rejected; nothing after this can succeed
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Local failure while handling remote data (spooling, reading a file)
    #[error("local I/O error: {0}")]
    Local(String),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_) | StoreError::RateLimited(_) | StoreError::Unavailable { .. }
        )
    }

    /// Whether the failure invalidates the whole run rather than one node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unauthenticated(_))
    }

    pub fn local(err: impl fmt::Display) -> Self {
        StoreError::Local(err.to_string())
    }
}

/// What a node is, as far as migration is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Folder,
    /// A live document with no static byte representation
    WorkspaceDocument,
    Shortcut,
}

impl NodeKind {
    pub fn from_mime(mime_type: &str) -> Self {
        match mime_type {
            FOLDER_MIME => NodeKind::Folder,
            SHORTCUT_MIME => NodeKind::Shortcut,
            m if m.starts_with(WORKSPACE_MIME_PREFIX) => NodeKind::WorkspaceDocument,
            _ => NodeKind::File,
        }
    }
}

/// Where a shortcut points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutTarget {
    pub id: String,
    pub mime_type: String,
    /// Whether the principal the store is acting for owns the target
    pub owned_by_me: bool,
}

/// A read-only view of a remote node, valid for the listing that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parent: Option<String>,
    /// Whether the principal the store is acting for owns the node
    pub owned_by_me: bool,
    pub shortcut_target: Option<ShortcutTarget>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mime(&self.mime_type)
    }
}

/// A shared-drive style grouping that has its own root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Owner,
    Organizer,
    FileOrganizer,
    Writer,
    Commenter,
    Reader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Owner => "owner",
            Role::Organizer => "organizer",
            Role::FileOrganizer => "fileOrganizer",
            Role::Writer => "writer",
            Role::Commenter => "commenter",
            Role::Reader => "reader",
        };
        write!(f, "{}", s)
    }
}

/// Who a permission is granted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Grantee {
    User { email: String },
    Group { email: String },
    Domain { domain: String },
    Anyone,
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::User { email } => write!(f, "user:{}", email),
            Grantee::Group { email } => write!(f, "group:{}", email),
            Grantee::Domain { domain } => write!(f, "domain:{}", domain),
            Grantee::Anyone => write!(f, "anyone"),
        }
    }
}

/// A sharing entry. The destination copy is always a new permission object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub grantee: Grantee,
    pub role: Role,
}

impl Permission {
    pub fn user(email: impl Into<String>, role: Role) -> Self {
        Self {
            grantee: Grantee::User {
                email: email.into(),
            },
            role,
        }
    }

    pub fn domain(domain: impl Into<String>, role: Role) -> Self {
        Self {
            grantee: Grantee::Domain {
                domain: domain.into(),
            },
            role,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.grantee, self.role)
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// List the direct children of a folder (or collection root).
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Node>, StoreError>;

    /// The flat set of nodes other principals shared with this one.
    async fn list_shared_with_me(&self) -> Result<Vec<Node>, StoreError>;

    /// Raw bytes of a plain file.
    async fn get_content(&self, node_id: &str) -> Result<ContentStream, StoreError>;

    /// A workspace document rendered into `target_type`.
    async fn export_content(
        &self,
        node_id: &str,
        target_type: &str,
    ) -> Result<ContentStream, StoreError>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError>;

    /// Create a file whose payload is the local file at `content`.
    ///
    /// The payload is read as it is sent, never held whole in memory.
    /// Implementations are responsible for not restarting large payloads from
    /// byte zero on a transient failure.
    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &Path,
    ) -> Result<String, StoreError>;

    async fn create_shortcut(
        &self,
        parent_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<String, StoreError>;

    async fn list_permissions(&self, node_id: &str) -> Result<Vec<Permission>, StoreError>;

    /// Grant `permission` on a node, optionally emailing the grantee.
    async fn create_permission(
        &self,
        node_id: &str,
        permission: &Permission,
        notify: bool,
    ) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError>;

    async fn create_collection(&self, name: &str) -> Result<String, StoreError>;
}
