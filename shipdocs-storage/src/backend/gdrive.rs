//! Google Drive backend.
//!
//! Drive addresses everything by id and allows duplicate names inside one
//! folder, so every folder step is a parent-scoped "find or create" and an
//! overwrite is "delete every same-named file, then create". Neither step is
//! atomic: concurrent first uploads can still produce duplicate folders or
//! files, and later lookups simply take the first match Drive returns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use shipdocs_common::layout::{checked_segment, thumbnail_folder, thumbnail_name, PRODUCT_TREE};
use shipdocs_common::{
    FileClassification, ProductFolderHandle, ReadHandle, SanitizedKey, StorageBackend, StorageError,
    StorageResult, StoredFileDescriptor,
};

use super::gdrive_auth::DriveAuth;
use super::{body_stream, failure_message};
use crate::clock::Clock;
use crate::config::{non_empty, DriveConfig};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    mime_type: Option<String>,
    web_view_link: Option<String>,
    web_content_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

pub struct DriveBackend {
    client: Client,
    api_base: String,
    upload_base: String,
    root_folder_id: String,
    auth: DriveAuth,
}

impl DriveBackend {
    pub fn from_config(config: &DriveConfig, client: Client, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let root_folder_id = non_empty(&config.folder_id)
            .ok_or_else(|| StorageError::ConfigurationMissing("GDRIVE_FOLDER_ID must be set".into()))?
            .to_string();
        let auth = DriveAuth::from_config(config, clock)?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            root_folder_id,
            auth,
        })
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, urlencoding::encode(id))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> StorageResult<Response> {
        let token = self.auth.access_token(&self.client).await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("{} request failed: {}", what, e)))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            // Revoked or rotated upstream; force a refresh on the next call.
            self.auth.invalidate().await;
        }
        Ok(resp)
    }

    /// Children of `parent_id` named exactly `name`, in Drive's listing order.
    async fn list_named(&self, parent_id: &str, name: &str, folders_only: bool) -> StorageResult<Vec<DriveFile>> {
        let q = children_query(parent_id, name, folders_only);
        let request = self
            .client
            .get(format!("{}/files", self.api_base))
            .query(&[("q", q.as_str()), ("fields", "files(id,name)"), ("spaces", "drive")]);
        let resp = self.send(request, "Drive list").await?;
        if !resp.status().is_success() {
            return Err(StorageError::StorageUnavailable(failure_message("Drive list", resp).await));
        }
        let list: FileList = resp
            .json()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("Invalid Drive list response: {}", e)))?;
        Ok(list.files)
    }

    async fn find_folder(&self, parent_id: &str, name: &str) -> StorageResult<Option<String>> {
        Ok(self
            .list_named(parent_id, name, true)
            .await?
            .into_iter()
            .next()
            .map(|f| f.id))
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> StorageResult<String> {
        if let Some(id) = self.find_folder(parent_id, name).await? {
            return Ok(id);
        }
        let request = self
            .client
            .post(format!("{}/files", self.api_base))
            .query(&[("fields", "id")])
            .json(&json!({
                "name": name,
                "parents": [parent_id],
                "mimeType": FOLDER_MIME,
            }));
        let resp = self.send(request, "Drive folder create").await?;
        if !resp.status().is_success() {
            return Err(StorageError::StorageUnavailable(
                failure_message("Drive folder create", resp).await,
            ));
        }
        let created: DriveFile = resp
            .json()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("Invalid Drive create response: {}", e)))?;
        debug!(parent = %parent_id, name = %name, id = %created.id, "Drive folder created");
        Ok(created.id)
    }

    async fn ensure_path<S: AsRef<str>>(&self, parent_id: &str, segments: &[S]) -> StorageResult<String> {
        let mut current = parent_id.to_string();
        for segment in segments {
            current = self.ensure_folder(&current, segment.as_ref()).await?;
        }
        Ok(current)
    }

    /// Delete every file named `name` in `parent_id`. Failures are logged;
    /// the upload that follows proceeds regardless.
    async fn delete_same_named(&self, parent_id: &str, name: &str) {
        let existing = match self.list_named(parent_id, name, false).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, name = %name, "Failed to check for existing Drive file");
                return;
            }
        };
        for file in existing {
            match self.delete_by_id(&file.id).await {
                Ok(()) => debug!(id = %file.id, name = %name, "Replaced existing Drive file"),
                Err(e) => warn!(error = %e, id = %file.id, "Failed to delete existing Drive file"),
            }
        }
    }

    async fn delete_by_id(&self, id: &str) -> StorageResult<()> {
        let resp = self.send(self.client.delete(self.file_url(id)), "Drive delete").await?;
        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(StorageError::FileNotFound(id.to_string())),
            _ => Err(StorageError::StorageUnavailable(failure_message("Drive delete", resp).await)),
        }
    }

    /// Multipart media upload of a new file into `parent_id`.
    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        data: &[u8],
        fields: &str,
    ) -> StorageResult<DriveFile> {
        let boundary = format!("shipdocs-{}", uuid::Uuid::new_v4().simple());
        let metadata = json!({ "name": name, "parents": [parent_id] });
        let body = multipart_related(&boundary, &metadata, mime_type, data);

        let request = self
            .client
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", fields)])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);
        let token = self.auth.access_token(&self.client).await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StorageError::StorageWriteFailed(format!("Drive upload request failed: {}", e)))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        if !resp.status().is_success() {
            return Err(StorageError::StorageWriteFailed(failure_message("Drive upload", resp).await));
        }
        resp.json()
            .await
            .map_err(|e| StorageError::StorageWriteFailed(format!("Invalid Drive upload response: {}", e)))
    }

    async fn replace_file(
        &self,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        data: &[u8],
        fields: &str,
    ) -> StorageResult<DriveFile> {
        self.delete_same_named(parent_id, name).await;
        let file = self.create_file(parent_id, name, mime_type, data, fields).await?;
        debug!(id = %file.id, name = %name, bytes = data.len(), "Drive upload complete");
        Ok(file)
    }

    /// Walk down to the serial folder without creating anything.
    async fn find_product_folder(&self, key: &SanitizedKey) -> StorageResult<Option<String>> {
        let mut current = self.root_folder_id.clone();
        for segment in key.segments() {
            match self.find_folder(&current, segment).await? {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

#[async_trait]
impl StorageBackend for DriveBackend {
    fn name(&self) -> &'static str {
        "gdrive"
    }

    async fn ensure_product_tree(&self, key: &SanitizedKey) -> StorageResult<ProductFolderHandle> {
        let product_id = self.ensure_path(&self.root_folder_id, &key.segments()).await?;

        let mut created: HashMap<String, String> = HashMap::new();
        for relative in PRODUCT_TREE {
            let (name, parents) = match relative.split_last() {
                Some(split) => split,
                None => continue,
            };
            let parent_id = if parents.is_empty() {
                product_id.clone()
            } else {
                created
                    .get(&parents.join("/"))
                    .cloned()
                    .unwrap_or_else(|| product_id.clone())
            };
            let id = self.ensure_folder(&parent_id, name).await?;
            created.insert(relative.join("/"), id);
        }

        info!(key = %key, id = %product_id, "Drive product tree ready");
        Ok(ProductFolderHandle::new(product_id))
    }

    async fn save_file(
        &self,
        handle: &ProductFolderHandle,
        classification: &FileClassification,
        original_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredFileDescriptor> {
        let name = checked_segment("file name", original_name)?;
        let parent_id = self.ensure_path(handle.as_str(), &classification.target_folder()).await?;
        let mime_type = if mime_type.is_empty() { "application/octet-stream" } else { mime_type };

        let file = self
            .replace_file(
                &parent_id,
                &name,
                mime_type,
                &data,
                "id,name,webViewLink,webContentLink",
            )
            .await?;
        Ok(StoredFileDescriptor {
            display_url: file.web_view_link.or(file.web_content_link),
            stored_name: if file.name.is_empty() { name } else { file.name },
            storage_id: file.id,
            thumbnail_storage_id: None,
        })
    }

    async fn save_thumbnail(
        &self,
        handle: &ProductFolderHandle,
        original_name: &str,
        jpeg: Bytes,
    ) -> StorageResult<StoredFileDescriptor> {
        checked_segment("file name", original_name)?;
        let name = thumbnail_name(original_name);
        let parent_id = self.ensure_path(handle.as_str(), &thumbnail_folder()).await?;
        let file = self.replace_file(&parent_id, &name, "image/jpeg", &jpeg, "id,name").await?;
        Ok(StoredFileDescriptor {
            storage_id: file.id,
            stored_name: name,
            display_url: None,
            thumbnail_storage_id: None,
        })
    }

    async fn open_read(&self, storage_id: &str) -> StorageResult<ReadHandle> {
        if storage_id.is_empty() {
            return Err(StorageError::FileNotFound(String::new()));
        }

        let meta_request = self
            .client
            .get(self.file_url(storage_id))
            .query(&[("fields", "id,name,mimeType")]);
        let resp = self.send(meta_request, "Drive metadata").await?;
        match resp.status().as_u16() {
            200..=299 => {}
            404 => return Err(StorageError::FileNotFound(storage_id.to_string())),
            _ => return Err(StorageError::StorageUnavailable(failure_message("Drive metadata", resp).await)),
        }
        let meta: DriveFile = resp
            .json()
            .await
            .map_err(|e| StorageError::StorageUnavailable(format!("Invalid Drive metadata: {}", e)))?;

        let content_request = self
            .client
            .get(self.file_url(storage_id))
            .query(&[("alt", "media")]);
        let resp = self.send(content_request, "Drive download").await?;
        match resp.status().as_u16() {
            200..=299 => {}
            404 => return Err(StorageError::FileNotFound(storage_id.to_string())),
            _ => return Err(StorageError::StorageUnavailable(failure_message("Drive download", resp).await)),
        }

        Ok(ReadHandle {
            name: meta.name,
            mime_type: meta
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            stream: body_stream(resp),
        })
    }

    async fn delete_product_tree(&self, key: &SanitizedKey) -> StorageResult<()> {
        let Some(product_id) = self.find_product_folder(key).await? else {
            debug!(key = %key, "Drive product tree already absent");
            return Ok(());
        };
        // Deleting a folder removes all of its descendants.
        match self.delete_by_id(&product_id).await {
            Ok(()) | Err(StorageError::FileNotFound(_)) => {
                info!(key = %key, id = %product_id, "Drive product tree deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Quote a value as a Drive query string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn children_query(parent_id: &str, name: &str, folders_only: bool) -> String {
    let mut clauses = vec![
        format!("{} in parents", quote(parent_id)),
        format!("name={}", quote(name)),
    ];
    if folders_only {
        clauses.push(format!("mimeType={}", quote(FOLDER_MIME)));
    }
    clauses.push("trashed=false".to_string());
    clauses.join(" and ")
}

/// Build a `multipart/related` body: JSON metadata followed by the media.
fn multipart_related(boundary: &str, metadata: &serde_json::Value, mime_type: &str, data: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: {mime}\r\n\r\n",
        b = boundary,
        meta = metadata,
        mime = mime_type,
    );
    let tail = format!("\r\n--{}--\r\n", boundary);
    let mut body = Vec::with_capacity(head.len() + data.len() + tail.len());
    body.extend_from_slice(head.as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(tail.as_bytes());
    body
}
