//! OAuth access-token handling shared by the Drive and Graph backends.
//!
//! Each backend instance owns one [`TokenCache`]. The cached token is reused
//! until it is within [`REFRESH_MARGIN_SECS`] seconds of expiry, measured against the
//! injected [`Clock`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use shipdocs_common::{StorageError, StorageResult};

use crate::clock::Clock;

pub const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct TokenCache {
    clock: Arc<dyn Clock>,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, current: Mutex::new(None) }
    }

    /// Start from a token obtained elsewhere (e.g. a saved token file).
    pub fn seeded(clock: Arc<dyn Clock>, token: Option<AccessToken>) -> Self {
        Self { clock, current: Mutex::new(token) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Return the cached token, calling `refresh` first if it is missing or
    /// about to expire. Concurrent callers wait for a single refresh.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> StorageResult<String>
    where
        F: FnOnce(DateTime<Utc>) -> Fut,
        Fut: Future<Output = StorageResult<AccessToken>>,
    {
        let mut current = self.current.lock().await;
        let now = self.clock.now();
        if let Some(token) = current.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.value.clone());
            }
        }
        let token = refresh(now).await?;
        debug!(expires_at = %token.expires_at, "Access token refreshed");
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// POST a form to an OAuth token endpoint and parse the access token.
///
/// A 400/401 means the credentials themselves are wrong and is reported as
/// [`StorageError::ConfigurationMissing`]; anything else is transient.
pub async fn request_token(
    client: &Client,
    token_url: &str,
    form: &[(&str, &str)],
    now: DateTime<Utc>,
) -> StorageResult<AccessToken> {
    let resp = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|e| StorageError::StorageUnavailable(format!("Token request failed: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = format!("Token request failed: HTTP {} - {}", status, body);
        return Err(match status.as_u16() {
            400 | 401 => StorageError::ConfigurationMissing(message),
            _ => StorageError::StorageUnavailable(message),
        });
    }

    let payload: TokenResponse = resp
        .json()
        .await
        .map_err(|e| StorageError::StorageUnavailable(format!("Invalid token response: {}", e)))?;
    Ok(AccessToken {
        value: payload.access_token,
        expires_at: now + Duration::seconds(payload.expires_in),
    })
}
