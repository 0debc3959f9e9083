use std::path::PathBuf;

use anyhow::{bail, Context};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shipdocs_common::{FileClassification, FileType, ProductFolderKey};
use shipdocs_storage::{StorageConfig, StorageRouter, UploadRequest};

const USAGE: &str = "usage: shipdocs-storage [--config FILE] <command>

commands:
  ensure <year> <customer> <project> <serial>
  upload <year> <customer> <project> <serial> <type> <file> [category]
  read <storage-id> <output-file>
  delete <year> <customer> <project> <serial>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = if args.first().map(String::as_str) == Some("--config") {
        let path = args.get(1).cloned().context(USAGE)?;
        args.drain(..2);
        StorageConfig::load(&PathBuf::from(path))?
    } else {
        StorageConfig::from_env()?
    };

    let router = StorageRouter::from_config(&config)?;
    info!(backend = router.backend_name(), "shipdocs-storage ready");

    let command = args.first().map(String::as_str).unwrap_or_default();
    let rest = args.get(1..).unwrap_or_default();
    match (command, rest) {
        ("ensure", [year, customer, project, serial]) => {
            let key = product_key(year, customer, project, serial)?;
            let handle = router.ensure_product_tree(&key).await?;
            println!("{}", handle);
        }
        ("upload", [year, customer, project, serial, file_type, file, category @ ..]) if category.len() <= 1 => {
            let key = product_key(year, customer, project, serial)?;
            let path = PathBuf::from(file);
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let original_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("upload path has no usable file name")?
                .to_string();
            let mime_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();

            let outcome = router
                .upload(UploadRequest {
                    handle: None,
                    key,
                    classification: FileClassification::new(
                        FileType::parse(file_type),
                        category.first().map(String::as_str),
                    ),
                    original_name,
                    data: Bytes::from(data),
                    mime_type,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        ("read", [storage_id, output]) => {
            let handle = router.open_read(storage_id).await?;
            info!(name = %handle.name, mime_type = %handle.mime_type, "Reading file");
            let mut out = tokio::fs::File::create(output)
                .await
                .with_context(|| format!("failed to create {}", output))?;
            let mut stream = handle.stream;
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                written += chunk.len();
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            println!("{} bytes written to {}", written, output);
        }
        ("delete", [year, customer, project, serial]) => {
            let key = product_key(year, customer, project, serial)?;
            router.delete_product_tree(&key).await?;
            println!("deleted");
        }
        _ => bail!(USAGE),
    }

    Ok(())
}

fn product_key(year: &str, customer: &str, project: &str, serial: &str) -> anyhow::Result<ProductFolderKey> {
    let year: i32 = year
        .parse()
        .with_context(|| format!("invalid year '{}'", year))?;
    Ok(ProductFolderKey::new(year, customer, project, serial))
}
