pub mod backend;
pub mod clock;
pub mod config;
pub mod router;
pub mod thumbnail;
pub mod token;

pub use config::{StorageConfig, StorageMode};
pub use router::{StorageRouter, UploadOutcome, UploadRequest};
