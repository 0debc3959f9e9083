pub mod backend;
pub mod error;
pub mod layout;
pub mod sanitize;
pub mod slots;

pub use backend::{ByteStream, ProductFolderHandle, ReadHandle, StorageBackend, StoredFileDescriptor};
pub use error::{StorageError, StorageResult};
pub use layout::{FileClassification, FileType, ProductFolderKey, SanitizedKey};
pub use sanitize::sanitize;
pub use slots::SlotVocabulary;
