//! Backend bearer-token providers.
//!
//! Every backend request carries `X-Auth-Token`. Tokens come either from the
//! configuration verbatim or from Keystone v3 password authentication, cached
//! until shortly before they expire.

use crate::config::AuthConfig;
use crate::storage::StorageError;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Refresh this long before Keystone says the token expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when the backend needs no authentication.
    async fn token(&self) -> Result<Option<String>, StorageError>;

    /// Drop any cached token so the next `token()` fetches a fresh one.
    fn invalidate(&self) {}
}

/// Build the configured token provider.
pub fn from_config(
    config: &AuthConfig,
    timeout_secs: u64,
) -> Result<Arc<dyn TokenProvider>, StorageError> {
    Ok(match config {
        AuthConfig::None => Arc::new(StaticTokenProvider::none()),
        AuthConfig::Static { token } => Arc::new(StaticTokenProvider::new(token.clone())),
        AuthConfig::Keystone {
            auth_url,
            username,
            password,
            user_domain,
            project_name,
            project_domain,
        } => Arc::new(KeystoneTokenProvider::new(
            KeystoneCredentials {
                auth_url: auth_url.clone(),
                username: username.clone(),
                password: password.clone(),
                user_domain: user_domain.clone(),
                project_name: project_name.clone(),
                project_domain: project_domain.clone(),
            },
            Duration::from_secs(timeout_secs),
        )?),
    })
}

/// Serves a fixed token (or none).
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct KeystoneCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_name: String,
    pub project_domain: String,
}

struct CachedToken {
    value: String,
    refresh_after: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
}

/// Keystone v3 password-auth token, scoped to one project.
pub struct KeystoneTokenProvider {
    client: reqwest::Client,
    credentials: KeystoneCredentials,
    cached: ArcSwapOption<CachedToken>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl KeystoneTokenProvider {
    pub fn new(credentials: KeystoneCredentials, timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(Self {
            client,
            credentials,
            cached: ArcSwapOption::empty(),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn current(&self) -> Option<String> {
        self.cached
            .load()
            .as_ref()
            .filter(|c| Utc::now() < c.refresh_after)
            .map(|c| c.value.clone())
    }

    async fn authenticate(&self) -> Result<CachedToken, StorageError> {
        let c = &self.credentials;
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.username,
                            "domain": { "name": c.user_domain },
                            "password": c.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.project_name,
                        "domain": { "name": c.project_domain },
                    }
                }
            }
        });

        let url = format!("{}/v3/auth/tokens", c.auth_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StorageError::Auth(format!("Keystone request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::Auth(format!(
                "Keystone returned {} for user {}",
                status, c.username
            )));
        }

        let value = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Auth("Keystone response had no X-Subject-Token".into()))?;
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Auth(format!("Malformed Keystone response: {}", e)))?;

        let refresh_after = parsed.token.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS);
        info!(
            "Obtained Keystone token for project {} (expires {})",
            c.project_name, parsed.token.expires_at
        );
        Ok(CachedToken {
            value,
            refresh_after,
        })
    }
}

#[async_trait]
impl TokenProvider for KeystoneTokenProvider {
    async fn token(&self) -> Result<Option<String>, StorageError> {
        if let Some(token) = self.current() {
            return Ok(Some(token));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(token) = self.current() {
            return Ok(Some(token));
        }

        debug!("Refreshing Keystone token");
        let fresh = self.authenticate().await?;
        let value = fresh.value.clone();
        self.cached.store(Some(Arc::new(fresh)));
        Ok(Some(value))
    }

    fn invalidate(&self) {
        warn!("Invalidating cached Keystone token");
        self.cached.store(None);
    }
}
