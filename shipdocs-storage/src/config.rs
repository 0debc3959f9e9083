use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use shipdocs_common::{SlotVocabulary, StorageError, StorageResult};

pub const DEFAULT_BASE_PATH: &str = "ShipmentDocs";
pub const DEFAULT_LOCAL_ROOT: &str = "storage";
pub const DEFAULT_HTTP_TIMEOUT_S: u64 = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    Gdrive,
    Graph,
}

impl FromStr for StorageMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "local" => Ok(StorageMode::Local),
            "gdrive" => Ok(StorageMode::Gdrive),
            "graph" => Ok(StorageMode::Graph),
            other => Err(StorageError::ConfigurationMissing(format!(
                "Unknown storage mode '{}'",
                other
            ))),
        }
    }
}

/// Process-wide storage configuration, built once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub local: LocalConfig,
    pub gdrive: DriveConfig,
    pub graph: GraphConfig,
    pub slots: SlotVocabulary,
    pub thumbnail: ThumbnailConfig,
    pub http_timeout_s: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            local: LocalConfig::default(),
            gdrive: DriveConfig::default(),
            graph: GraphConfig::default(),
            slots: SlotVocabulary::default(),
            thumbnail: ThumbnailConfig::default(),
            http_timeout_s: DEFAULT_HTTP_TIMEOUT_S,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub root: PathBuf,
    pub base_path: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_LOCAL_ROOT),
            base_path: DEFAULT_BASE_PATH.to_string(),
        }
    }
}

/// Google Drive settings. The `*_json` fields hold either raw JSON or a
/// path to a JSON file.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Id of the Drive folder that plays the role of `{root}`.
    pub folder_id: Option<String>,
    pub oauth_client_json: Option<String>,
    pub token_json: Option<String>,
    pub service_account_json: Option<String>,
    pub api_base: String,
    pub upload_base: String,
    /// Overrides the token endpoint named in the credential files.
    pub token_url: Option<String>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            oauth_client_json: None,
            token_json: None,
            service_account_json: None,
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            token_url: None,
        }
    }
}

impl fmt::Debug for DriveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveConfig")
            .field("folder_id", &self.folder_id)
            .field("oauth_client_json", &redacted(&self.oauth_client_json))
            .field("token_json", &redacted(&self.token_json))
            .field("service_account_json", &redacted(&self.service_account_json))
            .field("api_base", &self.api_base)
            .field("upload_base", &self.upload_base)
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// Microsoft Graph (OneDrive / SharePoint) settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub drive_id: Option<String>,
    pub site_id: Option<String>,
    pub base_path: String,
    pub api_base: String,
    pub authority: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            drive_id: None,
            site_id: None,
            base_path: DEFAULT_BASE_PATH.to_string(),
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
            authority: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl GraphConfig {
    /// Drive addressing prefix: an explicit drive, a site's default drive,
    /// or the signed-in user's drive.
    pub fn drive_root(&self) -> String {
        if let Some(drive_id) = non_empty(&self.drive_id) {
            format!("/drives/{}", urlencoding::encode(drive_id))
        } else if let Some(site_id) = non_empty(&self.site_id) {
            format!("/sites/{}/drive", urlencoding::encode(site_id))
        } else {
            "/me/drive".to_string()
        }
    }
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("drive_id", &self.drive_id)
            .field("site_id", &self.site_id)
            .field("base_path", &self.base_path)
            .field("api_base", &self.api_base)
            .field("authority", &self.authority)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Edge length of the square preview, in pixels.
    pub size: u32,
    pub quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self { size: 256, quality: 72 }
    }
}

impl StorageConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: StorageConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from the process environment.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset and blank variables
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = StorageConfig::default();

        if let Some(mode) = get("STORAGE_MODE") {
            config.mode = mode.parse()?;
        }
        if let Some(root) = get("STORAGE_ROOT") {
            config.local.root = PathBuf::from(root);
        }
        if let Some(base) = get("STORAGE_BASE_PATH") {
            config.local.base_path = base;
        }

        config.gdrive.folder_id = get("GDRIVE_FOLDER_ID");
        config.gdrive.oauth_client_json = get("GDRIVE_OAUTH_CLIENT_JSON");
        config.gdrive.token_json = get("GDRIVE_TOKEN_JSON");
        config.gdrive.service_account_json = get("GDRIVE_SERVICE_ACCOUNT_JSON");

        config.graph.tenant_id = get("GRAPH_TENANT_ID");
        config.graph.client_id = get("GRAPH_CLIENT_ID");
        config.graph.client_secret = get("GRAPH_CLIENT_SECRET");
        config.graph.drive_id = get("GRAPH_DRIVE_ID");
        config.graph.site_id = get("GRAPH_SITE_ID");
        if let Some(base) = get("GRAPH_BASE_PATH") {
            config.graph.base_path = base;
        }

        if let Some(timeout) = get("STORAGE_HTTP_TIMEOUT_S") {
            config.http_timeout_s = timeout.trim().parse().map_err(|_| {
                StorageError::ConfigurationMissing(format!(
                    "STORAGE_HTTP_TIMEOUT_S must be a number of seconds, got '{}'",
                    timeout
                ))
            })?;
        }
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.http_timeout_s == 0 {
            anyhow::bail!("http_timeout_s must be greater than zero");
        }
        if self.thumbnail.size == 0 {
            anyhow::bail!("thumbnail.size must be greater than zero");
        }
        if self.thumbnail.quality == 0 || self.thumbnail.quality > 100 {
            anyhow::bail!("thumbnail.quality must be between 1 and 100");
        }
        Ok(())
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Parse a JSON credential given either inline or as a file path.
pub fn load_json(setting: &str, value: &str) -> StorageResult<serde_json::Value> {
    let trimmed = value.trim();
    let raw = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        std::fs::read_to_string(trimmed).map_err(|e| {
            StorageError::ConfigurationMissing(format!("{} file '{}': {}", setting, trimmed, e))
        })?
    };
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::ConfigurationMissing(format!("{} is not valid JSON: {}", setting, e)))
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}
