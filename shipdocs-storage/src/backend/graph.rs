//! Microsoft Graph (OneDrive / SharePoint) backend.
//!
//! Graph addresses items by drive-relative path, so the product handle is the
//! serial folder's path (`ShipmentDocs/2025/ACME_Ltd./PRJ-17/SN-1042`) and
//! storage ids are item ids. Uploads use PUT-to-path with
//! `conflictBehavior=replace`, an atomic upsert by name.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use shipdocs_common::layout::{checked_segment, thumbnail_folder, thumbnail_name, PRODUCT_TREE};
use shipdocs_common::{
    FileClassification, ProductFolderHandle, ReadHandle, SanitizedKey, StorageBackend, StorageError,
    StorageResult, StoredFileDescriptor,
};

use super::{base_segments, body_stream, failure_message};
use crate::clock::Clock;
use crate::config::{non_empty, GraphConfig};
use crate::token::{request_token, TokenCache};

pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    folder: Option<Value>,
    file: Option<FileFacet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

pub struct GraphBackend {
    client: Client,
    api_base: String,
    drive_root: String,
    base: Vec<String>,
    token_url: String,
    client_id: String,
    client_secret: String,
    cache: TokenCache,
}

impl GraphBackend {
    pub fn from_config(config: &GraphConfig, client: Client, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let require = |value: &Option<String>, name: &str| {
            non_empty(value)
                .map(str::to_string)
                .ok_or_else(|| StorageError::ConfigurationMissing(format!("{} must be set", name)))
        };
        let tenant_id = require(&config.tenant_id, "GRAPH_TENANT_ID")?;
        let client_id = require(&config.client_id, "GRAPH_CLIENT_ID")?;
        let client_secret = require(&config.client_secret, "GRAPH_CLIENT_SECRET")?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            drive_root: config.drive_root(),
            base: base_segments(&config.base_path),
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                config.authority.trim_end_matches('/'),
                urlencoding::encode(&tenant_id)
            ),
            client_id,
            client_secret,
            cache: TokenCache::new(clock),
        })
    }

    fn drive_url(&self) -> String {
        format!("{}{}", self.api_base, self.drive_root)
    }

    /// URL addressing `path` relative to the drive root, with an optional
    /// `:/action` suffix such as `children` or `content`.
    fn path_url(&self, path: &str, action: Option<&str>) -> String {
        let encoded = encode_path(path);
        match (encoded.is_empty(), action) {
            (true, Some(action)) => format!("{}/root/{}", self.drive_url(), action),
            (true, None) => format!("{}/root", self.drive_url()),
            (false, Some(action)) => format!("{}/root:/{}:/{}", self.drive_url(), encoded, action),
            (false, None) => format!("{}/root:/{}", self.drive_url(), encoded),
        }
    }

    fn item_url(&self, item_id: &str) -> String {
        format!("{}/items/{}", self.drive_url(), urlencoding::encode(item_id))
    }

    async fn access_token(&self) -> StorageResult<String> {
        self.cache
            .get_or_refresh(|now| async move {
                let form = [
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("scope", GRAPH_SCOPE),
                    ("grant_type", "client_credentials"),
                ];
                request_token(&self.client, &self.token_url, &form, now).await
            })
            .await
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> StorageResult<Response> {
        let token = self.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("{} request failed: {}", what, e)))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.cache.invalidate().await;
        }
        Ok(resp)
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: Response, what: &str) -> StorageResult<T> {
        resp.json()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("Invalid {} response: {}", what, e)))
    }

    async fn item_by_path(&self, path: &str) -> StorageResult<Option<DriveItem>> {
        let resp = self.send(self.client.get(self.path_url(path, None)), "Graph lookup").await?;
        match resp.status().as_u16() {
            200..=299 => Ok(Some(Self::parse(resp, "Graph lookup").await?)),
            404 => Ok(None),
            _ => Err(StorageError::StorageUnavailable(failure_message("Graph lookup", resp).await)),
        }
    }

    /// Find-or-create `name` under `parent` (a drive-relative path, empty for
    /// the drive root). Returns the folder's path.
    async fn ensure_folder(&self, parent: &str, name: &str) -> StorageResult<String> {
        let path = join_path(parent, name);
        if let Some(item) = self.item_by_path(&path).await? {
            if item.folder.is_none() {
                return Err(StorageError::StorageUnavailable(format!(
                    "Graph item {} exists but is not a folder",
                    path
                )));
            }
            return Ok(path);
        }

        let request = self.client.post(self.path_url(parent, Some("children"))).json(&json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        }));
        let resp = self.send(request, "Graph folder create").await?;
        match resp.status().as_u16() {
            200..=299 => {
                debug!(path = %path, "Graph folder created");
                Ok(path)
            }
            // Created concurrently; make sure it really is a folder.
            409 => match self.item_by_path(&path).await? {
                Some(item) if item.folder.is_some() => Ok(path),
                _ => Err(StorageError::StorageUnavailable(format!(
                    "Graph folder create conflicted but {} is not a folder",
                    path
                ))),
            },
            _ => Err(StorageError::StorageUnavailable(
                failure_message("Graph folder create", resp).await,
            )),
        }
    }

    async fn ensure_path<S: AsRef<str>>(&self, parent: &str, segments: &[S]) -> StorageResult<String> {
        let mut current = parent.to_string();
        for segment in segments {
            current = self.ensure_folder(&current, segment.as_ref()).await?;
        }
        Ok(current)
    }

    async fn put_content(&self, folder: &str, name: &str, mime_type: &str, data: Bytes) -> StorageResult<DriveItem> {
        let path = join_path(folder, name);
        let request = self
            .client
            .put(self.path_url(&path, Some("content")))
            .query(&[("@microsoft.graph.conflictBehavior", "replace")])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(data);
        let token = self.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StorageError::StorageWriteFailed(format!("Graph upload request failed: {}", e)))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.cache.invalidate().await;
        }
        if !resp.status().is_success() {
            return Err(StorageError::StorageWriteFailed(failure_message("Graph upload", resp).await));
        }
        let item: DriveItem = resp
            .json()
            .await
            .map_err(|e| StorageError::StorageWriteFailed(format!("Invalid Graph upload response: {}", e)))?;
        debug!(path = %path, id = %item.id, "Graph upload complete");
        Ok(item)
    }

    fn product_path(&self, key: &SanitizedKey) -> String {
        self.base
            .iter()
            .map(String::as_str)
            .chain(key.segments())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Fetch the drive resource; used as a connectivity and credentials check.
    pub async fn health(&self) -> StorageResult<Value> {
        let resp = self.send(self.client.get(self.drive_url()), "Graph health").await?;
        if !resp.status().is_success() {
            return Err(StorageError::StorageUnavailable(failure_message("Graph health", resp).await));
        }
        Self::parse(resp, "Graph health").await
    }

    pub async fn get_item(&self, item_id: &str) -> StorageResult<Value> {
        let resp = self.send(self.client.get(self.item_url(item_id)), "Graph item").await?;
        match resp.status().as_u16() {
            200..=299 => Self::parse(resp, "Graph item").await,
            404 => Err(StorageError::FileNotFound(item_id.to_string())),
            _ => Err(StorageError::StorageUnavailable(failure_message("Graph item", resp).await)),
        }
    }

    /// Create a sharing link for an item (`kind` is e.g. `view` or `edit`,
    /// `scope` is `anonymous` or `organization`).
    pub async fn create_share_link(&self, item_id: &str, kind: &str, scope: &str) -> StorageResult<Value> {
        let request = self
            .client
            .post(format!("{}/createLink", self.item_url(item_id)))
            .json(&json!({ "type": kind, "scope": scope }));
        let resp = self.send(request, "Graph createLink").await?;
        match resp.status().as_u16() {
            200..=299 => Self::parse(resp, "Graph createLink").await,
            404 => Err(StorageError::FileNotFound(item_id.to_string())),
            _ => Err(StorageError::StorageUnavailable(failure_message("Graph createLink", resp).await)),
        }
    }
}

#[async_trait]
impl StorageBackend for GraphBackend {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn ensure_product_tree(&self, key: &SanitizedKey) -> StorageResult<ProductFolderHandle> {
        let base = self.ensure_path("", &self.base).await?;
        let product = self.ensure_path(&base, &key.segments()).await?;
        for relative in PRODUCT_TREE {
            if let Some((name, parents)) = relative.split_last() {
                let parent = parents.iter().fold(product.clone(), |path, s| join_path(&path, s));
                self.ensure_folder(&parent, name).await?;
            }
        }
        info!(key = %key, path = %product, "Graph product tree ready");
        Ok(ProductFolderHandle::new(product))
    }

    async fn save_file(
        &self,
        handle: &ProductFolderHandle,
        classification: &FileClassification,
        original_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredFileDescriptor> {
        let product = checked_handle(handle)?;
        let name = checked_segment("file name", original_name)?;
        let folder = self.ensure_path(product, &classification.target_folder()).await?;
        let mime_type = if mime_type.is_empty() { "application/octet-stream" } else { mime_type };
        let item = self.put_content(&folder, &name, mime_type, data).await?;
        Ok(StoredFileDescriptor {
            storage_id: item.id,
            stored_name: if item.name.is_empty() { name } else { item.name },
            display_url: None,
            thumbnail_storage_id: None,
        })
    }

    async fn save_thumbnail(
        &self,
        handle: &ProductFolderHandle,
        original_name: &str,
        jpeg: Bytes,
    ) -> StorageResult<StoredFileDescriptor> {
        let product = checked_handle(handle)?;
        checked_segment("file name", original_name)?;
        let name = thumbnail_name(original_name);
        let folder = self.ensure_path(product, &thumbnail_folder()).await?;
        let item = self.put_content(&folder, &name, "image/jpeg", jpeg).await?;
        Ok(StoredFileDescriptor {
            storage_id: item.id,
            stored_name: name,
            display_url: None,
            thumbnail_storage_id: None,
        })
    }

    async fn open_read(&self, storage_id: &str) -> StorageResult<ReadHandle> {
        if storage_id.is_empty() {
            return Err(StorageError::FileNotFound(String::new()));
        }

        let resp = self.send(self.client.get(self.item_url(storage_id)), "Graph metadata").await?;
        let item: DriveItem = match resp.status().as_u16() {
            200..=299 => Self::parse(resp, "Graph metadata").await?,
            404 => return Err(StorageError::FileNotFound(storage_id.to_string())),
            _ => return Err(StorageError::StorageUnavailable(failure_message("Graph metadata", resp).await)),
        };
        if item.folder.is_some() {
            return Err(StorageError::FileNotFound(format!("{} is a folder", storage_id)));
        }

        let content_url = format!("{}/content", self.item_url(storage_id));
        let resp = self.send(self.client.get(content_url), "Graph download").await?;
        match resp.status().as_u16() {
            200..=299 => {}
            404 => return Err(StorageError::FileNotFound(storage_id.to_string())),
            _ => return Err(StorageError::StorageUnavailable(failure_message("Graph download", resp).await)),
        }

        Ok(ReadHandle {
            name: item.name,
            mime_type: item
                .file
                .and_then(|f| f.mime_type)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            stream: body_stream(resp),
        })
    }

    async fn delete_product_tree(&self, key: &SanitizedKey) -> StorageResult<()> {
        let path = self.product_path(key);
        let resp = self.send(self.client.delete(self.path_url(&path, None)), "Graph delete").await?;
        match resp.status().as_u16() {
            200..=299 => {
                info!(path = %path, "Graph product tree deleted");
                Ok(())
            }
            404 => {
                debug!(path = %path, "Graph product tree already absent");
                Ok(())
            }
            _ => Err(StorageError::StorageUnavailable(failure_message("Graph delete", resp).await)),
        }
    }
}

/// A product handle is a drive-relative folder path; refuse anything that
/// could address a folder outside it.
fn checked_handle(handle: &ProductFolderHandle) -> StorageResult<&str> {
    let path = handle.as_str();
    let valid = !path.is_empty() && path.split('/').all(|s| !s.is_empty() && s != "." && s != "..");
    if !valid {
        return Err(StorageError::ValidationFailed(format!("Invalid product folder handle {:?}", path)));
    }
    Ok(path)
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Percent-encode each segment of a drive-relative path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn backend() -> GraphBackend {
        let config = GraphConfig {
            tenant_id: Some("tenant".into()),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            drive_id: Some("d1".into()),
            api_base: "https://graph.test/v1.0".into(),
            ..GraphConfig::default()
        };
        GraphBackend::from_config(&config, Client::new(), Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_path_urls() {
        let b = backend();
        assert_eq!(b.path_url("", Some("children")), "https://graph.test/v1.0/drives/d1/root/children");
        assert_eq!(
            b.path_url("ShipmentDocs/2025", Some("children")),
            "https://graph.test/v1.0/drives/d1/root:/ShipmentDocs/2025:/children"
        );
        assert_eq!(
            b.path_url("Docs/My_Report_#1.pdf", Some("content")),
            "https://graph.test/v1.0/drives/d1/root:/Docs/My_Report_%231.pdf:/content"
        );
        assert_eq!(b.path_url("A/B", None), "https://graph.test/v1.0/drives/d1/root:/A/B");
        assert_eq!(b.token_url, "https://login.microsoftonline.com/tenant/oauth2/v2.0/token");
    }

    #[test]
    fn test_product_path_includes_base() {
        let b = backend();
        let key = shipdocs_common::ProductFolderKey::new(2025, "ACME Ltd.", "PRJ-17", "SN-1042")
            .sanitized()
            .unwrap();
        assert_eq!(b.product_path(&key), "ShipmentDocs/2025/ACME_Ltd./PRJ-17/SN-1042");
    }

    #[test]
    fn test_checked_handle() {
        let ok = ProductFolderHandle::new("ShipmentDocs/2025/ACME_Ltd./PRJ-17/SN-1042");
        assert_eq!(checked_handle(&ok).unwrap(), ok.as_str());
        for bad in ["", "/ShipmentDocs/2025", "ShipmentDocs//2025", "ShipmentDocs/../Other", "./x", "a/b/"] {
            assert!(
                matches!(checked_handle(&ProductFolderHandle::new(bad)), Err(StorageError::ValidationFailed(_))),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_missing_credentials() {
        let config = GraphConfig {
            tenant_id: Some("tenant".into()),
            ..GraphConfig::default()
        };
        let result = GraphBackend::from_config(&config, Client::new(), Arc::new(SystemClock));
        assert!(matches!(result, Err(StorageError::ConfigurationMissing(_))));
    }
}
