//! Local filesystem backend.
//!
//! Products live under `{root}/{base_path}/{year}/{customer}/{project}/{serial}`.
//! Files are written atomically (temp file, fsync, rename). Names that do not
//! belong to a photo slot get a millisecond timestamp prefix so uploads never
//! collide; slot photos keep their name and overwrite the previous shot.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use shipdocs_common::layout::{checked_segment, thumbnail_folder, thumbnail_name, PRODUCT_TREE};
use shipdocs_common::{
    FileClassification, ProductFolderHandle, ReadHandle, SanitizedKey, SlotVocabulary,
    StorageBackend, StorageError, StorageResult, StoredFileDescriptor,
};

use crate::clock::Clock;
use crate::config::LocalConfig;

/// Ancestors of the serial folder considered for removal after a delete:
/// project, customer, year and the base folder.
const CLEANUP_LEVELS: usize = 4;

pub struct LocalBackend {
    root: PathBuf,
    base: PathBuf,
    slots: SlotVocabulary,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new(
        root: impl Into<PathBuf>,
        base_path: &str,
        slots: SlotVocabulary,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let root = root.into();
        let base = super::base_segments(base_path)
            .iter()
            .fold(root.clone(), |path, segment| path.join(segment));
        Self { root, base, slots, clock }
    }

    pub fn from_config(
        config: &LocalConfig,
        slots: SlotVocabulary,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        if config.root.as_os_str().is_empty() {
            return Err(StorageError::ConfigurationMissing("STORAGE_ROOT is empty".into()));
        }
        let root = std::path::absolute(&config.root).map_err(|e| {
            StorageError::ConfigurationMissing(format!(
                "Cannot resolve storage root {}: {}",
                config.root.display(),
                e
            ))
        })?;
        Ok(Self::new(root, &config.base_path, slots, clock))
    }

    fn product_path(&self, key: &SanitizedKey) -> PathBuf {
        key.segments()
            .iter()
            .fold(self.base.clone(), |path, segment| path.join(segment))
    }

    /// Resolve a handle or storage id to a path, refusing anything that
    /// could point outside the managed root.
    fn managed_path(&self, value: &str) -> StorageResult<PathBuf> {
        let path = PathBuf::from(value);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        if value.is_empty() || escapes || !path.starts_with(&self.root) || path == self.root {
            return Err(StorageError::ValidationFailed(format!(
                "Path {} is outside the storage root",
                value
            )));
        }
        Ok(path)
    }

    fn stored_name(&self, classification: &FileClassification, original_name: &str) -> StorageResult<String> {
        let safe = checked_segment("file name", original_name)?;
        if classification.is_photo() {
            if let Some(slot) = self.slots.match_name(&safe) {
                debug!(slot, name = %safe, "Photo matches slot, keeping name");
                return Ok(safe);
            }
        }
        Ok(format!("{}_{}", self.clock.now().timestamp_millis(), safe))
    }

    async fn ensure_dir(path: &Path) -> StorageResult<()> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            StorageError::StorageUnavailable(format!("Failed to create {}: {}", path.display(), e))
        })
    }

    async fn write_file(dest: &Path, data: &[u8]) -> StorageResult<()> {
        let write_failed = |what: &str, e: std::io::Error| {
            StorageError::StorageWriteFailed(format!("{} {}: {}", what, dest.display(), e))
        };
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        // One temp file per writer; concurrent saves of one name race only on the rename.
        let tmp_path = dest.with_file_name(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4().simple()));

        let result = Self::write_and_rename(&tmp_path, dest, data).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result.map_err(|(what, e)| write_failed(what, e))
    }

    async fn write_and_rename(tmp_path: &Path, dest: &Path, data: &[u8]) -> Result<(), (&'static str, std::io::Error)> {
        tokio::fs::write(tmp_path, data)
            .await
            .map_err(|e| ("Failed to write temp file for", e))?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(tmp_path)
            .await
            .map_err(|e| ("Failed to open temp file for", e))?;
        file.sync_all().await.map_err(|e| ("fsync failed for", e))?;
        drop(file);

        tokio::fs::rename(tmp_path, dest)
            .await
            .map_err(|e| ("Atomic rename failed for", e))
    }

    async fn store(&self, folder: PathBuf, name: String, data: &[u8]) -> StorageResult<StoredFileDescriptor> {
        Self::ensure_dir(&folder).await?;
        let dest = folder.join(&name);
        Self::write_file(&dest, data).await?;
        debug!(path = %dest.display(), bytes = data.len(), "Local write complete");
        Ok(StoredFileDescriptor {
            storage_id: dest.to_string_lossy().to_string(),
            stored_name: name,
            display_url: None,
            thumbnail_storage_id: None,
        })
    }

    /// Remove now-empty ancestors of `start`, never touching the root.
    async fn prune_empty_ancestors(&self, start: &Path) {
        let mut current = start.parent();
        for _ in 0..CLEANUP_LEVELS {
            let Some(dir) = current else { break };
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir refuses non-empty directories
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                debug!(path = %dir.display(), error = %e, "Ancestor kept");
                break;
            }
            debug!(path = %dir.display(), "Removed empty ancestor");
            current = dir.parent();
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ensure_product_tree(&self, key: &SanitizedKey) -> StorageResult<ProductFolderHandle> {
        let product = self.product_path(key);
        Self::ensure_dir(&product).await?;
        for relative in PRODUCT_TREE {
            let folder = relative.iter().fold(product.clone(), |path, s| path.join(s));
            Self::ensure_dir(&folder).await?;
        }
        info!(path = %product.display(), "Local product tree ready");
        Ok(ProductFolderHandle::new(product.to_string_lossy()))
    }

    async fn save_file(
        &self,
        handle: &ProductFolderHandle,
        classification: &FileClassification,
        original_name: &str,
        data: Bytes,
        _mime_type: &str,
    ) -> StorageResult<StoredFileDescriptor> {
        let product = self.managed_path(handle.as_str())?;
        let folder = classification
            .target_folder()
            .iter()
            .fold(product, |path, s| path.join(s));
        let name = self.stored_name(classification, original_name)?;
        self.store(folder, name, &data).await
    }

    async fn save_thumbnail(
        &self,
        handle: &ProductFolderHandle,
        original_name: &str,
        jpeg: Bytes,
    ) -> StorageResult<StoredFileDescriptor> {
        let product = self.managed_path(handle.as_str())?;
        checked_segment("file name", original_name)?;
        let folder = thumbnail_folder().iter().fold(product, |path, s| path.join(s));
        self.store(folder, thumbnail_name(original_name), &jpeg).await
    }

    async fn open_read(&self, storage_id: &str) -> StorageResult<ReadHandle> {
        let path = self.managed_path(storage_id)?;
        let not_found = || StorageError::FileNotFound(storage_id.to_string());

        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(StorageError::StorageUnavailable(format!(
                    "Failed to stat {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if !meta.is_file() {
            return Err(not_found());
        }

        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(),
            _ => StorageError::StorageUnavailable(format!("Failed to open {}: {}", path.display(), e)),
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| StorageError::StorageUnavailable(format!("Read failed: {}", e))))
            .boxed();

        Ok(ReadHandle { name, mime_type, stream })
    }

    async fn delete_product_tree(&self, key: &SanitizedKey) -> StorageResult<()> {
        let product = self.product_path(key);
        match tokio::fs::remove_dir_all(&product).await {
            Ok(()) => info!(path = %product.display(), "Local product tree deleted"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %product.display(), "Product tree already absent");
            }
            Err(e) => {
                return Err(StorageError::StorageUnavailable(format!(
                    "Failed to delete {}: {}",
                    product.display(),
                    e
                )))
            }
        }
        self.prune_empty_ancestors(&product).await;
        Ok(())
    }
}
