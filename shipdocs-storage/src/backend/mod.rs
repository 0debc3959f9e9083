pub mod gdrive;
pub mod gdrive_auth;
pub mod graph;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, Response};

use shipdocs_common::{ByteStream, StorageBackend, StorageError, StorageResult};

use crate::clock::Clock;
use crate::config::{StorageConfig, StorageMode};

use self::gdrive::DriveBackend;
use self::graph::GraphBackend;
use self::local::LocalBackend;

/// Construct the backend selected by `config.mode`.
///
/// Missing settings for the selected backend are reported as
/// [`StorageError::ConfigurationMissing`]; settings for the other backends
/// are ignored.
pub fn from_config(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> StorageResult<Box<dyn StorageBackend>> {
    match config.mode {
        StorageMode::Local => Ok(Box::new(LocalBackend::from_config(
            &config.local,
            config.slots.clone(),
            clock,
        )?)),
        StorageMode::Gdrive => {
            let client = http_client(config.http_timeout_s)?;
            Ok(Box::new(DriveBackend::from_config(&config.gdrive, client, clock)?))
        }
        StorageMode::Graph => {
            let client = http_client(config.http_timeout_s)?;
            Ok(Box::new(GraphBackend::from_config(&config.graph, client, clock)?))
        }
    }
}

pub fn http_client(timeout_s: u64) -> StorageResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_s))
        .build()
        .map_err(|e| StorageError::ConfigurationMissing(format!("Failed to build HTTP client: {}", e)))
}

/// `"{what} failed: HTTP {status} - {body}"` for a non-2xx response.
pub(crate) async fn failure_message(what: &str, resp: Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("{} failed: HTTP {} - {}", what, status, body)
}

/// Stream a response body, mapping transport errors to `StorageUnavailable`.
pub(crate) fn body_stream(resp: Response) -> ByteStream {
    resp.bytes_stream()
        .map(|chunk| {
            chunk.map_err(|e| StorageError::StorageUnavailable(format!("Download interrupted: {}", e)))
        })
        .boxed()
}

/// Split a configured base path like `"Shipments/QC"` into sanitised segments.
pub(crate) fn base_segments(base_path: &str) -> Vec<String> {
    base_path
        .split('/')
        .map(shipdocs_common::sanitize)
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .collect()
}
