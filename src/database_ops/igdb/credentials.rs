use reqwest::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::IgdbSyncConfig;
use super::error::SyncError;
use super::models::TwitchTokenResponse;

#[derive(Debug, Clone)]
struct AccessToken {
    access_token: String,
    expires_at: Instant,
}

/// Caches the Twitch client-credentials token used for every IGDB request.
pub struct CredentialManager {
    http: Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
    skew: Duration,
    token: Mutex<Option<AccessToken>>,
}

impl CredentialManager {
    pub fn new(http: Client, cfg: &IgdbSyncConfig) -> Self {
        Self {
            http,
            auth_url: cfg.auth_url.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            skew: cfg.token_skew,
            token: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Cached token if still fresh, otherwise a new client-credential exchange.
    ///
    /// The cache lock is held across the exchange so at most one refresh is in flight.
    pub async fn get_token(&self) -> Result<String, SyncError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() + self.skew < token.expires_at {
                return Ok(token.access_token.clone());
            }
            debug!(target = "igdb", "cached token expired; refreshing");
        }
        let fresh = self.exchange().await?;
        let access = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access)
    }

    /// Forget the cached token (after a 401 from a data endpoint).
    pub async fn invalidate(&self) {
        let mut guard = self.token.lock().await;
        if guard.take().is_some() {
            warn!(target = "igdb", "cached token rejected upstream; invalidated");
        }
    }

    async fn exchange(&self) -> Result<AccessToken, SyncError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(SyncError::Config(
                "TWITCH_CLIENT_ID and TWITCH_CLIENT_SECRET must be set".into(),
            ));
        }
        let response = self
            .http
            .post(&self.auth_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|err| SyncError::Auth {
                status: None,
                message: format!("token request failed: {err}"),
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth {
                status: Some(status.as_u16()),
                message: truncate(&text, 200),
            });
        }
        let body = response.text().await.map_err(|err| SyncError::Auth {
            status: Some(status.as_u16()),
            message: format!("reading token response: {err}"),
        })?;
        let token: TwitchTokenResponse =
            serde_json::from_str(&body).map_err(|err| SyncError::Auth {
                status: Some(status.as_u16()),
                message: format!("malformed token response: {err}"),
            })?;
        info!(
            target = "igdb",
            expires_in = token.expires_in,
            "obtained twitch access token"
        );
        Ok(AccessToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
