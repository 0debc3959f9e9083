use std::fmt;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::layout::{FileClassification, SanitizedKey};

/// Opaque, backend-specific reference to a product's serial folder.
///
/// A filesystem path for the local backend, a folder id for Drive and a
/// drive-relative path for Graph. Owned by the product record and handed
/// back on every file operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductFolderHandle(String);

impl ProductFolderHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductFolderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFileDescriptor {
    /// Durable identifier for later reads.
    pub storage_id: String,
    /// Final name the file was stored under.
    pub stored_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_storage_id: Option<String>,
}

pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// An open file: display name, content type and its bytes as a stream.
pub struct ReadHandle {
    pub name: String,
    pub mime_type: String,
    pub stream: ByteStream,
}

impl ReadHandle {
    /// `Content-Disposition` value for serving the file as a download.
    pub fn content_disposition(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        format!("attachment; filename=\"{}\"", name)
    }

    /// Drain the stream into memory.
    pub async fn into_bytes(self) -> StorageResult<Bytes> {
        let mut stream = self.stream;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Trait implemented by all storage backends.
///
/// A backend owns the I/O against one provider (local filesystem, Google
/// Drive, Microsoft Graph). Key validation, backend selection and the
/// best-effort thumbnail path belong to the router; the backend is
/// responsible only for folders, bytes and identifiers.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Find-or-create the product tree and return the serial folder handle.
    /// Calling it again for the same key addresses the same folder.
    async fn ensure_product_tree(&self, key: &SanitizedKey) -> StorageResult<ProductFolderHandle>;

    /// Store `data` in the sub-folder selected by `classification`.
    async fn save_file(
        &self,
        handle: &ProductFolderHandle,
        classification: &FileClassification,
        original_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredFileDescriptor>;

    /// Store a JPEG preview under `Photos/Thumbnails`, replacing any
    /// thumbnail of the same name.
    async fn save_thumbnail(
        &self,
        handle: &ProductFolderHandle,
        original_name: &str,
        jpeg: Bytes,
    ) -> StorageResult<StoredFileDescriptor>;

    /// Open a stored file by the identifier a save returned.
    async fn open_read(&self, storage_id: &str) -> StorageResult<ReadHandle>;

    /// Recursively delete the serial folder. Absent trees are not an error.
    async fn delete_product_tree(&self, key: &SanitizedKey) -> StorageResult<()>;
}
