//! Google Drive credentials.
//!
//! Two modes are supported: an installed-app OAuth client with a saved
//! refresh token, or a service account that signs its own JWT assertions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use shipdocs_common::{StorageError, StorageResult};

use crate::clock::Clock;
use crate::config::{load_json, non_empty, DriveConfig};
use crate::token::{request_token, AccessToken, TokenCache};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_S: i64 = 3600;

enum Credentials {
    InstalledApp {
        client_id: String,
        client_secret: String,
        refresh_token: Option<String>,
    },
    ServiceAccount {
        client_email: String,
        key: EncodingKey,
    },
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct DriveAuth {
    credentials: Credentials,
    token_url: String,
    cache: TokenCache,
}

impl DriveAuth {
    /// Resolve credentials from configuration. A service account takes
    /// precedence when both kinds are configured.
    pub fn from_config(config: &DriveConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        if let Some(raw) = non_empty(&config.service_account_json) {
            return Self::service_account(&load_json("GDRIVE_SERVICE_ACCOUNT_JSON", raw)?, config, clock);
        }

        let client_raw = non_empty(&config.oauth_client_json).ok_or_else(|| {
            StorageError::ConfigurationMissing(
                "GDRIVE_OAUTH_CLIENT_JSON or GDRIVE_SERVICE_ACCOUNT_JSON must be set".into(),
            )
        })?;
        let token_raw = non_empty(&config.token_json)
            .ok_or_else(|| StorageError::ConfigurationMissing("GDRIVE_TOKEN_JSON must be set".into()))?;
        Self::installed_app(
            &load_json("GDRIVE_OAUTH_CLIENT_JSON", client_raw)?,
            &load_json("GDRIVE_TOKEN_JSON", token_raw)?,
            config,
            clock,
        )
    }

    fn installed_app(
        client: &Value,
        token: &Value,
        config: &DriveConfig,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let section = client
            .get("installed")
            .or_else(|| client.get("web"))
            .ok_or_else(|| {
                StorageError::ConfigurationMissing(
                    "OAuth client JSON has neither an 'installed' nor a 'web' section".into(),
                )
            })?;
        let client_id = required_str(section, "client_id", "OAuth client JSON")?;
        let client_secret = required_str(section, "client_secret", "OAuth client JSON")?;
        let token_url = config
            .token_url
            .clone()
            .or_else(|| optional_str(section, "token_uri"))
            .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

        let refresh_token = optional_str(token, "refresh_token");
        let saved = optional_str(token, "access_token").and_then(|value| {
            let expires_at = token
                .get("expiry_date")
                .and_then(Value::as_i64)
                .and_then(DateTime::<Utc>::from_timestamp_millis)?;
            Some(AccessToken { value, expires_at })
        });
        if refresh_token.is_none() && saved.is_none() {
            return Err(StorageError::ConfigurationMissing(
                "Token JSON has neither a refresh_token nor a usable access_token".into(),
            ));
        }

        Ok(Self {
            credentials: Credentials::InstalledApp { client_id, client_secret, refresh_token },
            token_url,
            cache: TokenCache::seeded(clock, saved),
        })
    }

    fn service_account(account: &Value, config: &DriveConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let client_email = required_str(account, "client_email", "Service account JSON")?;
        let private_key = required_str(account, "private_key", "Service account JSON")?;
        let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
            StorageError::ConfigurationMissing(format!("Service account private_key is invalid: {}", e))
        })?;
        let token_url = config
            .token_url
            .clone()
            .or_else(|| optional_str(account, "token_uri"))
            .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

        Ok(Self {
            credentials: Credentials::ServiceAccount { client_email, key },
            token_url,
            cache: TokenCache::new(clock),
        })
    }

    /// Current bearer token, refreshed when close to expiry.
    pub async fn access_token(&self, client: &Client) -> StorageResult<String> {
        self.cache
            .get_or_refresh(|now| self.fetch_token(client, now))
            .await
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    async fn fetch_token(&self, client: &Client, now: DateTime<Utc>) -> StorageResult<AccessToken> {
        match &self.credentials {
            Credentials::InstalledApp { client_id, client_secret, refresh_token } => {
                let refresh_token = refresh_token.as_deref().ok_or_else(|| {
                    StorageError::ConfigurationMissing(
                        "Saved Drive access token expired and no refresh_token is available".into(),
                    )
                })?;
                let form = [
                    ("refresh_token", refresh_token),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("grant_type", "refresh_token"),
                ];
                request_token(client, &self.token_url, &form, now).await
            }
            Credentials::ServiceAccount { client_email, key } => {
                let claims = AssertionClaims {
                    iss: client_email,
                    scope: DRIVE_SCOPE,
                    aud: &self.token_url,
                    iat: now.timestamp(),
                    exp: (now + Duration::seconds(ASSERTION_LIFETIME_S)).timestamp(),
                };
                let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
                    .map_err(|e| {
                        StorageError::ConfigurationMissing(format!("Failed to sign assertion: {}", e))
                    })?;
                let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
                request_token(client, &self.token_url, &form, now).await
            }
        }
    }
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_str(value: &Value, field: &str, source: &str) -> StorageResult<String> {
    optional_str(value, field)
        .ok_or_else(|| StorageError::ConfigurationMissing(format!("{} is missing '{}'", source, field)))
}
