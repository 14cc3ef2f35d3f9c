use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::config::IgdbSyncConfig;
use super::credentials::CredentialManager;
use super::error::SyncError;
use super::governor::RateGovernor;
use super::models::EntityKind;
use super::query::{CatalogPageQuery, IgdbQuery};

/// Upstream catalog as seen by the pipeline. `IgdbClient` is the real one; tests script their own.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Make sure a valid credential is available before the run starts paging.
    async fn authenticate(&self) -> Result<(), SyncError>;

    /// Raw rows of one catalog page; the driver parses them record by record.
    async fn fetch_page(&self, query: &CatalogPageQuery) -> Result<Vec<Value>, SyncError>;

    /// `Ok(None)` when the endpoint answers with an empty array.
    async fn fetch_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<Value>, SyncError>;
}

pub struct IgdbClient {
    cfg: IgdbSyncConfig,
    http: Client,
    credentials: CredentialManager,
    governor: Arc<RateGovernor>,
}

impl IgdbClient {
    pub fn new(cfg: IgdbSyncConfig) -> Result<Self, SyncError> {
        let governor = Arc::new(RateGovernor::new(cfg.max_requests, cfg.cooldown));
        Self::with_governor(cfg, governor)
    }

    pub fn with_governor(
        cfg: IgdbSyncConfig,
        governor: Arc<RateGovernor>,
    ) -> Result<Self, SyncError> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|err| SyncError::Config(format!("failed to construct IGDB HTTP client: {err}")))?;
        let credentials = CredentialManager::new(http.clone(), &cfg);
        Ok(Self {
            cfg,
            http,
            credentials,
            governor,
        })
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// POST one query body to the endpoint of `kind` and return the raw JSON array.
    ///
    /// Every attempt passes through the governor. Transport errors, 429 and 5xx are retried with
    /// linear backoff up to `max_retries`; a 401 drops the cached token and is retried once.
    #[instrument(level = "debug", skip(self, body), fields(kind = %kind))]
    async fn execute(
        &self,
        kind: EntityKind,
        id: Option<i64>,
        body: String,
    ) -> Result<Vec<Value>, SyncError> {
        let url = self.cfg.endpoint_url(kind);
        let mut attempt = 0u32;
        let mut reauthed = false;
        loop {
            let token = self.credentials.get_token().await?;
            self.governor.acquire().await;
            let response = self
                .http
                .post(&url)
                .header("Client-ID", self.credentials.client_id())
                .header("Content-Type", "text/plain")
                .header("Authorization", format!("Bearer {token}"))
                .body(body.clone())
                .send()
                .await;

            let err = match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp
                            .text()
                            .await
                            .map_err(|source| SyncError::Transport { kind, source })?;
                        return serde_json::from_str::<Vec<Value>>(&text)
                            .map_err(|source| SyncError::Parse { kind, id, source });
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        self.credentials.invalidate().await;
                        if reauthed {
                            return Err(SyncError::Auth {
                                status: Some(401),
                                message: format!("{kind} endpoint rejected a fresh token"),
                            });
                        }
                        reauthed = true;
                        continue;
                    }
                    SyncError::Upstream {
                        kind,
                        id,
                        status: status.as_u16(),
                    }
                }
                Err(source) => SyncError::Transport { kind, source },
            };

            if err.is_retryable() && attempt < self.cfg.max_retries {
                attempt += 1;
                let wait = self.cfg.backoff_ms * attempt as u64;
                warn!(
                    target = "igdb",
                    kind = %kind,
                    external_id = ?id,
                    attempt,
                    wait_ms = wait,
                    error = %err,
                    "retrying igdb request"
                );
                tokio::time::sleep(Duration::from_millis(wait)).await;
                continue;
            }
            return Err(err);
        }
    }
}

#[async_trait]
impl CatalogApi for IgdbClient {
    async fn authenticate(&self) -> Result<(), SyncError> {
        self.credentials.get_token().await.map(|_| ())
    }

    async fn fetch_page(&self, query: &CatalogPageQuery) -> Result<Vec<Value>, SyncError> {
        let rows = self.execute(EntityKind::Game, None, query.to_body()).await?;
        debug!(
            target = "igdb",
            offset = query.offset,
            rows = rows.len(),
            "fetched catalog page"
        );
        Ok(rows)
    }

    async fn fetch_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<Value>, SyncError> {
        let rows = self
            .execute(kind, Some(id), IgdbQuery::by_id(id).to_body())
            .await?;
        Ok(rows.into_iter().next())
    }
}
