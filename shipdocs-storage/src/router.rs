//! The storage façade handed to the HTTP layer.
//!
//! A router owns exactly one backend, chosen once from [`StorageConfig`], and
//! adds the behaviour every backend shares: key validation, per-product
//! serialisation of folder creation, and best-effort thumbnails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use shipdocs_common::layout::checked_segment;
use shipdocs_common::{
    FileClassification, ProductFolderHandle, ProductFolderKey, ReadHandle, SanitizedKey, StorageBackend,
    StorageResult, StoredFileDescriptor,
};

use crate::backend;
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::thumbnail::{JpegThumbnailer, ThumbnailGenerator};

/// One async mutex per sanitized product key.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<SanitizedKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn entry(&self, key: &SanitizedKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Forget `key` once nobody but the map holds its lock.
    fn release(&self, key: &SanitizedKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Handle stored on the product record, if the tree was created before.
    pub handle: Option<ProductFolderHandle>,
    pub key: ProductFolderKey,
    pub classification: FileClassification,
    pub original_name: String,
    pub data: Bytes,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub handle: ProductFolderHandle,
    pub descriptor: StoredFileDescriptor,
    /// True when this upload created the product tree; the caller should
    /// persist `handle` on the product record.
    pub handle_created: bool,
}

pub struct StorageRouter {
    backend: Box<dyn StorageBackend>,
    thumbnailer: Arc<dyn ThumbnailGenerator>,
    tree_locks: KeyedLocks,
}

impl StorageRouter {
    pub fn new(backend: Box<dyn StorageBackend>, thumbnailer: Arc<dyn ThumbnailGenerator>) -> Self {
        Self {
            backend,
            thumbnailer,
            tree_locks: KeyedLocks::default(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(config: &StorageConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let backend = backend::from_config(config, clock)?;
        info!(backend = backend.name(), "Storage backend selected");
        Ok(Self::new(
            backend,
            Arc::new(JpegThumbnailer::from_config(&config.thumbnail)),
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn ensure_product_tree(&self, key: &ProductFolderKey) -> StorageResult<ProductFolderHandle> {
        let key = key.sanitized()?;
        let lock = self.tree_locks.entry(&key);
        let result = {
            let _guard = lock.lock().await;
            self.backend.ensure_product_tree(&key).await
        };
        self.tree_locks.release(&key, lock);
        result
    }

    pub async fn save_file(
        &self,
        handle: &ProductFolderHandle,
        classification: &FileClassification,
        original_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> StorageResult<StoredFileDescriptor> {
        checked_segment("file name", original_name)?;
        self.backend
            .save_file(handle, classification, original_name, data, mime_type)
            .await
    }

    pub async fn save_thumbnail(
        &self,
        handle: &ProductFolderHandle,
        original_name: &str,
        jpeg: Bytes,
    ) -> StorageResult<StoredFileDescriptor> {
        checked_segment("file name", original_name)?;
        self.backend.save_thumbnail(handle, original_name, jpeg).await
    }

    pub async fn open_read(&self, storage_id: &str) -> StorageResult<ReadHandle> {
        self.backend.open_read(storage_id).await
    }

    pub async fn delete_product_tree(&self, key: &ProductFolderKey) -> StorageResult<()> {
        let key = key.sanitized()?;
        self.backend.delete_product_tree(&key).await
    }

    /// Delete a product's tree as part of a larger cascade. Failures are
    /// logged and reported as `false`; they never abort the caller.
    pub async fn cleanup_product_tree(&self, key: &ProductFolderKey) -> bool {
        match self.delete_product_tree(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, serial = %key.serial, "Product folder cleanup failed");
                false
            }
        }
    }

    /// Full upload flow: ensure the tree when no handle is stored yet, save
    /// the file, and for photos attach a best-effort thumbnail.
    pub async fn upload(&self, request: UploadRequest) -> StorageResult<UploadOutcome> {
        let UploadRequest {
            handle,
            key,
            classification,
            original_name,
            data,
            mime_type,
        } = request;
        checked_segment("file name", &original_name)?;

        let (handle, handle_created) = match handle {
            Some(handle) if !handle.as_str().is_empty() => (handle, false),
            _ => (self.ensure_product_tree(&key).await?, true),
        };

        let source = if classification.is_photo() { Some(data.clone()) } else { None };
        let mut descriptor = self
            .backend
            .save_file(&handle, &classification, &original_name, data, &mime_type)
            .await?;

        if let Some(source) = source {
            descriptor.thumbnail_storage_id = self
                .attach_thumbnail(&handle, &descriptor.stored_name, source)
                .await;
        }

        debug!(
            backend = self.backend.name(),
            storage_id = %descriptor.storage_id,
            file_type = %classification.file_type,
            "Upload stored"
        );
        Ok(UploadOutcome { handle, descriptor, handle_created })
    }

    async fn attach_thumbnail(&self, handle: &ProductFolderHandle, stored_name: &str, source: Bytes) -> Option<String> {
        let jpeg = match self.thumbnailer.generate(source).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(error = %e, name = %stored_name, "Thumbnail creation failed");
                return None;
            }
        };
        match self.backend.save_thumbnail(handle, stored_name, jpeg).await {
            Ok(thumb) => Some(thumb.storage_id),
            Err(e) => {
                warn!(error = %e, name = %stored_name, "Thumbnail upload failed");
                None
            }
        }
    }
}
