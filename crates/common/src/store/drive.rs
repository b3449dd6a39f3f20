//! Drive v3 REST client
//!
//! A thin [`RemoteStore`] over `reqwest`. Every request carries a bearer
//! token for one principal; obtaining and refreshing that token is the
//! caller's business. HTTP failures are classified into [`StoreError`] here
//! so the retry policy never has to look at status codes.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION,
    RANGE,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

use super::{
    Collection, ContentStream, Grantee, Node, Permission, RemoteStore, Role, ShortcutTarget,
    StoreError, FOLDER_MIME, SHORTCUT_MIME,
};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3/";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3/";

const PAGE_SIZE: &str = "1000";
const FILE_FIELDS: &str =
    "nextPageToken,files(id,name,mimeType,parents,ownedByMe,shortcutDetails(targetId,targetMimeType))";
const PERMISSION_FIELDS: &str = "nextPageToken,permissions(type,role,emailAddress,domain)";
const DRIVE_FIELDS: &str = "nextPageToken,drives(id,name)";
/// Consecutive failed chunks before a resumable session is given up
const SESSION_ATTEMPTS: u32 = 3;
/// Bytes per resumable session request. Every chunk but the last must be a
/// multiple of 256 KiB.
const UPLOAD_CHUNK: u64 = 32 * 256 * 1024;

#[derive(Clone)]
pub struct DriveConfig {
    pub api_base: Url,
    pub upload_base: Url,
    /// OAuth bearer token for the principal this store acts as
    pub token: String,
}

impl DriveConfig {
    pub fn new(token: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            api_base: Url::parse(DEFAULT_API_BASE)?,
            upload_base: Url::parse(DEFAULT_UPLOAD_BASE)?,
            token: token.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: Url) -> Self {
        self.api_base = api_base;
        self
    }

    pub fn with_upload_base(mut self, upload_base: Url) -> Self {
        self.upload_base = upload_base;
        self
    }
}

impl std::fmt::Debug for DriveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveConfig")
            .field("api_base", &self.api_base.as_str())
            .field("upload_base", &self.upload_base.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct DriveStore {
    api_base: Url,
    upload_base: Url,
    client: Client,
}

impl DriveStore {
    pub fn new(config: DriveConfig) -> Result<Self, StoreError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| StoreError::InvalidRequest("token is not a valid header value".into()))?;
        auth.set_sensitive(true);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(AUTHORIZATION, auth);
        let client = Client::builder()
            .default_headers(default_headers)
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;

        Ok(Self {
            api_base: with_trailing_slash(config.api_base),
            upload_base: with_trailing_slash(config.upload_base),
            client,
        })
    }

    fn url(base: &Url, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidRequest(format!("unusable base url: {}", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, StoreError> {
        let response = request.send().await.map_err(transport)?;
        let response = check(response).await?;
        response.json::<T>().await.map_err(transport)
    }

    async fn list_files(
        &self,
        query: &str,
        all_drives: bool,
    ) -> Result<Vec<DriveFile>, StoreError> {
        let url = Self::url(&self.api_base, &["files"])?;
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(url.clone()).query(&[
                ("q", query),
                ("fields", FILE_FIELDS),
                ("pageSize", PAGE_SIZE),
            ]);
            if all_drives {
                request = request.query(&[
                    ("corpora", "allDrives"),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ]);
            }
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: FileList = Self::send_json(request).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        tracing::trace!(query, count = files.len(), "listed files");
        Ok(files)
    }

    async fn to_node(&self, file: DriveFile) -> Result<Node, StoreError> {
        let shortcut_target = match file.shortcut_details {
            Some(details) => {
                let owned_by_me = self.owns(&details.target_id).await?;
                Some(ShortcutTarget {
                    mime_type: details.target_mime_type.unwrap_or_default(),
                    id: details.target_id,
                    owned_by_me,
                })
            }
            None => None,
        };
        Ok(Node {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            parent: file.parents.into_iter().next(),
            owned_by_me: file.owned_by_me,
            shortcut_target,
        })
    }

    /// Whether the acting principal owns `id`. A target we cannot see is
    /// treated as foreign.
    async fn owns(&self, id: &str) -> Result<bool, StoreError> {
        let request = self
            .client
            .get(Self::url(&self.api_base, &["files", id])?)
            .query(&[("fields", "ownedByMe"), ("supportsAllDrives", "true")]);
        match Self::send_json::<Ownership>(request).await {
            Ok(ownership) => Ok(ownership.owned_by_me),
            Err(StoreError::NotFound(_)) | Err(StoreError::PermissionDenied(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn content(&self, request: RequestBuilder) -> Result<ContentStream, StoreError> {
        let response = request.send().await.map_err(transport)?;
        let response = check(response).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport))
            .boxed())
    }

    async fn create(&self, metadata: serde_json::Value) -> Result<String, StoreError> {
        let request = self
            .client
            .post(Self::url(&self.api_base, &["files"])?)
            .query(&[("supportsAllDrives", "true"), ("fields", "id")])
            .json(&metadata);
        let created: Created = Self::send_json(request).await?;
        Ok(created.id)
    }

    /// Push the file at `path` through a resumable session one chunk at a
    /// time, seeking back to the offset the service acknowledged when a
    /// chunk fails in transit.
    async fn upload_session(
        &self,
        session: &str,
        path: &Path,
        total: u64,
        mime_type: &str,
    ) -> Result<String, StoreError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(StoreError::local)?;
        let mut offset = 0u64;
        let mut failures = 0;
        loop {
            let len = chunk_len(offset, total);
            let mut chunk = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(StoreError::local)?;
            file.read_exact(&mut chunk)
                .await
                .map_err(StoreError::local)?;

            let request = self
                .client
                .put(session)
                .header(CONTENT_TYPE, mime_type)
                .header(CONTENT_LENGTH, len)
                .header(CONTENT_RANGE, content_range(offset, len, total))
                .body(chunk);

            let err = match request.send().await {
                Ok(response) => match response.status().as_u16() {
                    200 | 201 => {
                        let created: Created = response.json().await.map_err(transport)?;
                        return Ok(created.id);
                    }
                    308 => {
                        let next = acknowledged(&response).min(total);
                        if next > offset {
                            offset = next;
                            failures = 0;
                            tracing::trace!(offset, total, "upload chunk accepted");
                            continue;
                        }
                        StoreError::Network(format!("upload chunk at {} not acknowledged", offset))
                    }
                    _ => error_from(response).await,
                },
                Err(err) => transport(err),
            };
            failures += 1;
            if !err.is_transient() || failures >= SESSION_ATTEMPTS {
                return Err(err);
            }

            match self.session_state(session, total).await? {
                SessionState::Complete(id) => return Ok(id),
                SessionState::Resume(next) => {
                    tracing::debug!(offset = next, total, error = %err, "resuming upload session");
                    offset = next.min(total);
                }
            }
        }
    }

    async fn session_state(&self, session: &str, total: u64) -> Result<SessionState, StoreError> {
        let response = self
            .client
            .put(session)
            .header(CONTENT_RANGE, format!("bytes */{}", total))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(transport)?;

        match response.status().as_u16() {
            200 | 201 => {
                let created: Created = response.json().await.map_err(transport)?;
                Ok(SessionState::Complete(created.id))
            }
            308 => Ok(SessionState::Resume(acknowledged(&response))),
            _ => Err(error_from(response).await),
        }
    }
}

impl std::fmt::Debug for DriveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveStore")
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Node>, StoreError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(parent_id));
        let mut nodes = Vec::new();
        for file in self.list_files(&query, true).await? {
            nodes.push(self.to_node(file).await?);
        }
        Ok(nodes)
    }

    async fn list_shared_with_me(&self) -> Result<Vec<Node>, StoreError> {
        let mut nodes = Vec::new();
        for file in self
            .list_files("sharedWithMe = true and trashed = false", false)
            .await?
        {
            nodes.push(self.to_node(file).await?);
        }
        Ok(nodes)
    }

    async fn get_content(&self, node_id: &str) -> Result<ContentStream, StoreError> {
        let request = self
            .client
            .get(Self::url(&self.api_base, &["files", node_id])?)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        self.content(request).await
    }

    async fn export_content(
        &self,
        node_id: &str,
        target_type: &str,
    ) -> Result<ContentStream, StoreError> {
        let request = self
            .client
            .get(Self::url(&self.api_base, &["files", node_id, "export"])?)
            .query(&[("mimeType", target_type)]);
        self.content(request).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        self.create(json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent_id],
        }))
        .await
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &Path,
    ) -> Result<String, StoreError> {
        let total = tokio::fs::metadata(content)
            .await
            .map_err(StoreError::local)?
            .len();
        let mime_type = mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string();
        let request = self
            .client
            .post(Self::url(&self.upload_base, &["files"])?)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", "id"),
            ])
            .header("X-Upload-Content-Type", mime_type.as_str())
            .header("X-Upload-Content-Length", total)
            .json(&json!({ "name": name, "parents": [parent_id] }));

        let response = check(request.send().await.map_err(transport)?).await?;
        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| StoreError::Other("upload session has no location".into()))?
            .to_string();

        self.upload_session(&session, content, total, &mime_type)
            .await
    }

    async fn create_shortcut(
        &self,
        parent_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<String, StoreError> {
        self.create(json!({
            "name": name,
            "mimeType": SHORTCUT_MIME,
            "parents": [parent_id],
            "shortcutDetails": { "targetId": target_id },
        }))
        .await
    }

    async fn list_permissions(&self, node_id: &str) -> Result<Vec<Permission>, StoreError> {
        let url = Self::url(&self.api_base, &["files", node_id, "permissions"])?;
        let mut permissions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(url.clone())
                .query(&[("fields", PERMISSION_FIELDS), ("supportsAllDrives", "true")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: PermissionList = Self::send_json(request).await?;
            permissions.extend(
                page.permissions
                    .into_iter()
                    .filter_map(DrivePermission::into_permission),
            );
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(permissions)
    }

    async fn create_permission(
        &self,
        node_id: &str,
        permission: &Permission,
        notify: bool,
    ) -> Result<(), StoreError> {
        let notify = if notify { "true" } else { "false" };
        let request = self
            .client
            .post(Self::url(&self.api_base, &["files", node_id, "permissions"])?)
            .query(&[
                ("sendNotificationEmail", notify),
                ("supportsAllDrives", "true"),
                ("fields", "id"),
            ])
            .json(&permission_body(permission));
        let _: Created = Self::send_json(request).await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let url = Self::url(&self.api_base, &["drives"])?;
        let mut collections = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(url.clone())
                .query(&[("fields", DRIVE_FIELDS), ("pageSize", "100")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: DriveList = Self::send_json(request).await?;
            collections.extend(page.drives.into_iter().map(|d| Collection {
                id: d.id,
                name: d.name,
            }));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(collections)
    }

    async fn create_collection(&self, name: &str) -> Result<String, StoreError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = self
            .client
            .post(Self::url(&self.api_base, &["drives"])?)
            .query(&[("requestId", request_id.as_str())])
            .json(&json!({ "name": name }));
        let created: Created = Self::send_json(request).await?;
        Ok(created.id)
    }
}

enum SessionState {
    Complete(String),
    Resume(u64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    owned_by_me: bool,
    shortcut_details: Option<ShortcutDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShortcutDetails {
    target_id: String,
    target_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ownership {
    #[serde(default)]
    owned_by_me: bool,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionList {
    next_page_token: Option<String>,
    #[serde(default)]
    permissions: Vec<DrivePermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrivePermission {
    #[serde(rename = "type")]
    kind: String,
    role: String,
    email_address: Option<String>,
    domain: Option<String>,
}

impl DrivePermission {
    fn into_permission(self) -> Option<Permission> {
        let role = match self.role.as_str() {
            "owner" => Role::Owner,
            "organizer" => Role::Organizer,
            "fileOrganizer" => Role::FileOrganizer,
            "writer" => Role::Writer,
            "commenter" => Role::Commenter,
            "reader" => Role::Reader,
            other => {
                tracing::debug!(role = other, "unknown permission role");
                return None;
            }
        };
        let grantee = match self.kind.as_str() {
            "user" => Grantee::User {
                email: self.email_address?,
            },
            "group" => Grantee::Group {
                email: self.email_address?,
            },
            "domain" => Grantee::Domain {
                domain: self.domain?,
            },
            "anyone" => Grantee::Anyone,
            other => {
                tracing::debug!(kind = other, "unknown permission type");
                return None;
            }
        };
        Some(Permission { grantee, role })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveList {
    next_page_token: Option<String>,
    #[serde(default)]
    drives: Vec<SharedDrive>,
}

#[derive(Debug, Deserialize)]
struct SharedDrive {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

fn permission_body(permission: &Permission) -> serde_json::Value {
    let role = permission.role.to_string();
    match &permission.grantee {
        Grantee::User { email } => json!({ "type": "user", "role": role, "emailAddress": email }),
        Grantee::Group { email } => json!({ "type": "group", "role": role, "emailAddress": email }),
        Grantee::Domain { domain } => json!({ "type": "domain", "role": role, "domain": domain }),
        Grantee::Anyone => json!({ "type": "anyone", "role": role }),
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from(response).await)
    }
}

async fn error_from(response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify(status, &body)
}

/// Map an HTTP failure onto the store's error classes.
fn classify(status: StatusCode, body: &str) -> StoreError {
    let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope.error.message,
            envelope
                .error
                .errors
                .into_iter()
                .map(|detail| detail.reason)
                .collect(),
        ),
        Err(_) if body.trim().is_empty() => (status.to_string(), Vec::new()),
        Err(_) => (body.trim().to_string(), Vec::new()),
    };
    let rate_limited = reasons
        .iter()
        .any(|reason| reason == "rateLimitExceeded" || reason == "userRateLimitExceeded");

    match status {
        StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited(message),
        StatusCode::FORBIDDEN if rate_limited => StoreError::RateLimited(message),
        StatusCode::UNAUTHORIZED => StoreError::Unauthenticated(message),
        StatusCode::FORBIDDEN => StoreError::PermissionDenied(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST => StoreError::InvalidRequest(message),
        StatusCode::REQUEST_TIMEOUT => StoreError::Network(message),
        s if s.is_server_error() => StoreError::Unavailable {
            status: s.as_u16(),
            message,
        },
        s => StoreError::Other(format!("{}: {}", s, message)),
    }
}

fn transport(err: reqwest::Error) -> StoreError {
    if err.is_builder() {
        StoreError::InvalidRequest(err.to_string())
    } else if err.is_decode() {
        StoreError::Other(format!("malformed response: {}", err))
    } else if let Some(status) = err.status() {
        classify(status, "")
    } else {
        StoreError::Network(err.to_string())
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Last acknowledged byte from a `Range: bytes=0-N` header.
fn range_end(range: &str) -> Option<u64> {
    range.strip_prefix("bytes=")?.split('-').nth(1)?.parse().ok()
}

/// Offset to continue from after a 308; no `Range` means nothing arrived.
fn acknowledged(response: &Response) -> u64 {
    response
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(range_end)
        .map_or(0, |end| end + 1)
}

fn chunk_len(offset: u64, total: u64) -> u64 {
    total.saturating_sub(offset).min(UPLOAD_CHUNK)
}

fn content_range(offset: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", offset, offset + len - 1, total)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
