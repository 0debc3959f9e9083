//! In-process fake Google Drive and Microsoft Graph servers.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};

use shipdocs_common::ProductFolderKey;
use shipdocs_storage::clock::ManualClock;

pub const NOW_MS: i64 = 1_735_689_600_000;
pub const DRIVE_ROOT: &str = "root-folder";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

pub fn acme_key() -> ProductFolderKey {
    ProductFolderKey::new(2025, "ACME Ltd.", "PRJ-17", "SN-1042")
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::at_millis(NOW_MS))
}

/// A small decodable PNG, so thumbnail generation succeeds.
pub fn sample_png() -> axum::body::Bytes {
    let img = image::RgbImage::from_pixel(40, 20, image::Rgb([200, 10, 10]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    axum::body::Bytes::from(out.into_inner())
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer fake-token-"))
}

fn token_response(issued: usize) -> Response {
    Json(json!({
        "access_token": format!("fake-token-{}", issued),
        "expires_in": 3600,
        "token_type": "Bearer",
    }))
    .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": {"code": "itemNotFound"}}))).into_response()
}

// ---------------------------------------------------------------------------
// Google Drive

#[derive(Debug, Clone)]
pub struct DriveEntry {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl DriveEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Default)]
pub struct DriveState {
    next_id: usize,
    pub entries: BTreeMap<String, DriveEntry>,
    pub token_requests: usize,
    pub folder_creates: usize,
    /// Next N media uploads answer 500.
    pub failing_uploads: usize,
    /// Next N media uploads answer 401 as if the token had been revoked.
    pub rejected_uploads: usize,
    pub fail_folder_creates: bool,
}

impl DriveState {
    fn insert(&mut self, name: &str, parent: &str, mime_type: &str, data: Vec<u8>) -> DriveEntry {
        self.next_id += 1;
        let entry = DriveEntry {
            id: format!("id-{:06}", self.next_id),
            name: name.to_string(),
            parent: parent.to_string(),
            mime_type: mime_type.to_string(),
            data,
        };
        self.entries.insert(entry.id.clone(), entry.clone());
        entry
    }

    pub fn children(&self, parent: &str) -> Vec<&DriveEntry> {
        self.entries.values().filter(|e| e.parent == parent).collect()
    }

    pub fn child_names(&self, parent: &str) -> Vec<String> {
        let mut names: Vec<String> = self.children(parent).iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Follow `segments` from the configured root folder, first match wins.
    pub fn files(&self) -> Vec<&DriveEntry> {
        self.entries.values().filter(|e| !e.is_folder()).collect()
    }

    pub fn find_path(&self, segments: &[&str]) -> Option<String> {
        let mut current = DRIVE_ROOT.to_string();
        for segment in segments {
            current = self
                .children(&current)
                .into_iter()
                .find(|e| e.name == *segment)?
                .id
                .clone();
        }
        Some(current)
    }

    fn delete_recursive(&mut self, id: &str) {
        let children: Vec<String> = self.children(id).iter().map(|e| e.id.clone()).collect();
        for child in children {
            self.delete_recursive(&child);
        }
        self.entries.remove(id);
    }
}

pub struct FakeDrive {
    pub base: String,
    pub state: Arc<Mutex<DriveState>>,
}

impl FakeDrive {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(DriveState::default()));
        let router = Router::new().fallback(drive_handler).with_state(state.clone());
        Self { base: serve(router).await, state }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, DriveState> {
        self.state.lock().unwrap()
    }

    pub fn config_toml(&self) -> String {
        format!(
            r#"
mode = "gdrive"

[gdrive]
folder_id = "{root}"
oauth_client_json = '{{"installed": {{"client_id": "cid", "client_secret": "cs"}}}}'
token_json = '{{"refresh_token": "rt"}}'
api_base = "{base}/drive/v3"
upload_base = "{base}/upload/drive/v3"
token_url = "{base}/token"
"#,
            root = DRIVE_ROOT,
            base = self.base,
        )
    }
}

fn unquote(literal: &str) -> String {
    literal
        .trim()
        .trim_start_matches('\'')
        .trim_end_matches('\'')
        .replace("\\'", "'")
        .replace("\\\\", "\\")
}

struct DriveQuery {
    parent: Option<String>,
    name: Option<String>,
    mime_type: Option<String>,
}

fn parse_drive_query(q: &str) -> DriveQuery {
    let mut parsed = DriveQuery { parent: None, name: None, mime_type: None };
    for clause in q.split(" and ") {
        if let Some(parent) = clause.strip_suffix(" in parents") {
            parsed.parent = Some(unquote(parent));
        } else if let Some(name) = clause.strip_prefix("name=") {
            parsed.name = Some(unquote(name));
        } else if let Some(mime) = clause.strip_prefix("mimeType=") {
            parsed.mime_type = Some(unquote(mime));
        }
    }
    parsed
}

fn split_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            parts.push(&haystack[start..i]);
            i += needle.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&haystack[start..]);
    parts
}

/// Returns (metadata JSON, media bytes) from a `multipart/related` body.
fn parse_multipart_related(headers: &HeaderMap, body: &[u8]) -> Option<(Value, Vec<u8>)> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let boundary = content_type.split("boundary=").nth(1)?.trim();
    let delimiter = format!("--{}", boundary);
    let mut contents = split_bytes(body, delimiter.as_bytes())
        .into_iter()
        .filter(|part| !part.is_empty() && !part.starts_with(b"--"))
        .map(|part| {
            let split = split_bytes(part, b"\r\n\r\n");
            let content = &part[split[0].len() + 4..];
            content.strip_suffix(b"\r\n").unwrap_or(content).to_vec()
        });
    let metadata: Value = serde_json::from_slice(&contents.next()?).ok()?;
    let media = contents.next()?;
    Some((metadata, media))
}

async fn drive_handler(
    State(state): State<Arc<Mutex<DriveState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut state = state.lock().unwrap();

    if path == "/token" && method == Method::POST {
        state.token_requests += 1;
        return token_response(state.token_requests);
    }
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if path == "/upload/drive/v3/files" && method == Method::POST {
        if state.rejected_uploads > 0 {
            state.rejected_uploads -= 1;
            return StatusCode::UNAUTHORIZED.into_response();
        }
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return (StatusCode::INTERNAL_SERVER_ERROR, "backend error").into_response();
        }
        let Some((metadata, media)) = parse_multipart_related(&headers, &body) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let name = metadata["name"].as_str().unwrap_or_default().to_string();
        let parent = metadata["parents"][0].as_str().unwrap_or_default().to_string();
        let mime_type = {
            let part_head = String::from_utf8_lossy(&body).to_string();
            part_head
                .split("Content-Type: ")
                .nth(2)
                .and_then(|rest| rest.split("\r\n").next())
                .unwrap_or("application/octet-stream")
                .to_string()
        };
        let entry = state.insert(&name, &parent, &mime_type, media);
        return Json(json!({
            "id": entry.id,
            "name": entry.name,
            "webViewLink": format!("https://drive.test/file/d/{}/view", entry.id),
        }))
        .into_response();
    }

    if path == "/drive/v3/files" {
        if method == Method::GET {
            let q = parse_drive_query(query.get("q").map(String::as_str).unwrap_or_default());
            let files: Vec<Value> = state
                .entries
                .values()
                .filter(|e| q.parent.as_ref().map_or(true, |p| &e.parent == p))
                .filter(|e| q.name.as_ref().map_or(true, |n| &e.name == n))
                .filter(|e| q.mime_type.as_ref().map_or(true, |m| &e.mime_type == m))
                .map(|e| json!({"id": e.id, "name": e.name}))
                .collect();
            return Json(json!({ "files": files })).into_response();
        }
        if method == Method::POST {
            let Ok(metadata) = serde_json::from_slice::<Value>(&body) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let name = metadata["name"].as_str().unwrap_or_default().to_string();
            let parent = metadata["parents"][0].as_str().unwrap_or_default().to_string();
            let mime_type = metadata["mimeType"].as_str().unwrap_or_default().to_string();
            if state.fail_folder_creates {
                return (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response();
            }
            state.folder_creates += 1;
            let entry = state.insert(&name, &parent, &mime_type, Vec::new());
            return Json(json!({ "id": entry.id })).into_response();
        }
    }

    if let Some(id) = path.strip_prefix("/drive/v3/files/") {
        let id = urlencoding::decode(id).map(|s| s.into_owned()).unwrap_or_default();
        let Some(entry) = state.entries.get(&id).cloned() else {
            return not_found();
        };
        if method == Method::DELETE {
            state.delete_recursive(&id);
            return StatusCode::NO_CONTENT.into_response();
        }
        if method == Method::GET {
            if query.get("alt").map(String::as_str) == Some("media") {
                return ([(header::CONTENT_TYPE, entry.mime_type)], entry.data).into_response();
            }
            return Json(json!({"id": entry.id, "name": entry.name, "mimeType": entry.mime_type}))
                .into_response();
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

// ---------------------------------------------------------------------------
// Microsoft Graph

pub const GRAPH_DRIVE: &str = "/v1.0/drives/d1";
pub const GRAPH_TENANT: &str = "tenant-1";

#[derive(Debug, Clone)]
pub struct GraphItem {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
    pub folder: bool,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct GraphState {
    next_id: usize,
    pub items: BTreeMap<String, GraphItem>,
    pub token_requests: usize,
    pub folder_conflicts: usize,
    pub uploads: usize,
    /// Next N content uploads answer 500.
    pub failing_uploads: usize,
    pub fail_folder_creates: bool,
}

impl Default for GraphState {
    fn default() -> Self {
        let mut items = BTreeMap::new();
        items.insert(
            "root".to_string(),
            GraphItem {
                id: "root".into(),
                name: "root".into(),
                parent: None,
                folder: true,
                mime_type: String::new(),
                data: Vec::new(),
            },
        );
        Self {
            next_id: 0,
            items,
            token_requests: 0,
            folder_conflicts: 0,
            uploads: 0,
            failing_uploads: 0,
            fail_folder_creates: false,
        }
    }
}

impl GraphState {
    pub fn child(&self, parent: &str, name: &str) -> Option<&GraphItem> {
        self.items
            .values()
            .find(|i| i.parent.as_deref() == Some(parent) && i.name == name)
    }

    pub fn children(&self, parent: &str) -> Vec<&GraphItem> {
        self.items.values().filter(|i| i.parent.as_deref() == Some(parent)).collect()
    }

    pub fn child_names(&self, parent: &str) -> Vec<String> {
        let mut names: Vec<String> = self.children(parent).iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    pub fn files(&self) -> Vec<&GraphItem> {
        self.items.values().filter(|i| !i.folder).collect()
    }

    pub fn resolve(&self, path: &str) -> Option<&GraphItem> {
        let mut current = self.items.get("root")?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child(&current.id, segment)?;
        }
        Some(current)
    }

    fn insert(&mut self, parent: &str, name: &str, folder: bool, mime_type: &str, data: Vec<u8>) -> GraphItem {
        self.next_id += 1;
        let item = GraphItem {
            id: format!("item-{:06}", self.next_id),
            name: name.to_string(),
            parent: Some(parent.to_string()),
            folder,
            mime_type: mime_type.to_string(),
            data,
        };
        self.items.insert(item.id.clone(), item.clone());
        item
    }

    fn delete_recursive(&mut self, id: &str) {
        let children: Vec<String> = self.children(id).iter().map(|i| i.id.clone()).collect();
        for child in children {
            self.delete_recursive(&child);
        }
        self.items.remove(id);
    }

    fn item_json(&self, item: &GraphItem) -> Value {
        if item.folder {
            json!({
                "id": item.id,
                "name": item.name,
                "folder": { "childCount": self.children(&item.id).len() },
            })
        } else {
            json!({
                "id": item.id,
                "name": item.name,
                "size": item.data.len(),
                "file": { "mimeType": item.mime_type },
            })
        }
    }
}

pub struct FakeGraph {
    pub base: String,
    pub state: Arc<Mutex<GraphState>>,
}

impl FakeGraph {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(GraphState::default()));
        let router = Router::new().fallback(graph_handler).with_state(state.clone());
        Self { base: serve(router).await, state }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap()
    }

    pub fn config_toml(&self) -> String {
        format!(
            r#"
mode = "graph"

[graph]
tenant_id = "{tenant}"
client_id = "cid"
client_secret = "secret"
drive_id = "d1"
api_base = "{base}/v1.0"
authority = "{base}"
"#,
            tenant = GRAPH_TENANT,
            base = self.base,
        )
    }
}

async fn graph_handler(
    State(state): State<Arc<Mutex<GraphState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = urlencoding::decode(uri.path())
        .map(|s| s.into_owned())
        .unwrap_or_default();
    let mut state = state.lock().unwrap();

    if path == format!("/{}/oauth2/v2.0/token", GRAPH_TENANT) && method == Method::POST {
        let form = String::from_utf8_lossy(&body);
        if !form.contains("grant_type=client_credentials") || !form.contains("client_secret=secret") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_client"}))).into_response();
        }
        state.token_requests += 1;
        return token_response(state.token_requests);
    }
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(rest) = path.strip_prefix(GRAPH_DRIVE) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if rest.is_empty() && method == Method::GET {
        return Json(json!({"id": "d1", "driveType": "business", "name": "Documents"})).into_response();
    }

    if rest == "/root/children" && method == Method::POST {
        return create_folder(&mut state, "root", &body);
    }

    if let Some(inner) = rest.strip_prefix("/root:/") {
        if let Some(parent_path) = inner.strip_suffix(":/children") {
            if method != Method::POST {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            let Some(parent) = state.resolve(parent_path).map(|p| p.id.clone()) else {
                return not_found();
            };
            return create_folder(&mut state, &parent, &body);
        }
        if let Some(file_path) = inner.strip_suffix(":/content") {
            if method != Method::PUT {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            if query.get("@microsoft.graph.conflictBehavior").map(String::as_str) != Some("replace") {
                return StatusCode::BAD_REQUEST.into_response();
            }
            if state.failing_uploads > 0 {
                state.failing_uploads -= 1;
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": {"code": "generalException"}})))
                    .into_response();
            }
            let (parent_path, name) = file_path.rsplit_once('/').unwrap_or(("", file_path));
            let Some(parent) = state.resolve(parent_path).map(|p| p.id.clone()) else {
                return not_found();
            };
            let mime_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            state.uploads += 1;
            let existing = state.child(&parent, name).map(|i| i.id.clone());
            let item = match existing {
                Some(id) => {
                    let item = state.items.get_mut(&id).unwrap();
                    item.data = body.to_vec();
                    item.mime_type = mime_type;
                    item.clone()
                }
                None => state.insert(&parent, name, false, &mime_type, body.to_vec()),
            };
            return Json(state.item_json(&item)).into_response();
        }

        let Some(item) = state.resolve(inner).cloned() else {
            return not_found();
        };
        return match method {
            Method::GET => Json(state.item_json(&item)).into_response(),
            Method::DELETE => {
                state.delete_recursive(&item.id);
                StatusCode::NO_CONTENT.into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    if let Some(inner) = rest.strip_prefix("/items/") {
        let (id, action) = inner.split_once('/').unwrap_or((inner, ""));
        let Some(item) = state.items.get(id).cloned() else {
            return not_found();
        };
        return match (method, action) {
            (Method::GET, "") => Json(state.item_json(&item)).into_response(),
            (Method::GET, "content") => {
                ([(header::CONTENT_TYPE, item.mime_type.clone())], item.data.clone()).into_response()
            }
            (Method::POST, "createLink") => {
                let request: Value = serde_json::from_slice(&body).unwrap_or_default();
                Json(json!({
                    "id": format!("perm-{}", item.id),
                    "link": {
                        "type": request["type"],
                        "scope": request["scope"],
                        "webUrl": format!("https://share.test/{}", item.id),
                    },
                }))
                .into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

fn create_folder(state: &mut GraphState, parent: &str, body: &[u8]) -> Response {
    let Ok(request) = serde_json::from_slice::<Value>(body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let name = request["name"].as_str().unwrap_or_default().to_string();
    if state.fail_folder_creates {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": {"code": "serviceNotAvailable"}})))
            .into_response();
    }
    if state.child(parent, &name).is_some() {
        state.folder_conflicts += 1;
        return (StatusCode::CONFLICT, Json(json!({"error": {"code": "nameAlreadyExists"}}))).into_response();
    }
    let item = state.insert(parent, &name, true, "", Vec::new());
    (StatusCode::CREATED, Json(state.item_json(&item))).into_response()
}

/// Write `toml` to a scratch file and load it the way the binary does.
pub fn load_config(toml: &str) -> shipdocs_storage::StorageConfig {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.toml");
    std::fs::write(&path, toml).unwrap();
    shipdocs_storage::StorageConfig::load(&path).unwrap()
}
