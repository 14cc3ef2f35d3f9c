// Trigger server: POST /api/v1/igdb/sync starts a run, GET /api/v1/igdb/sync/status reports it.

use anyhow::{Context, Result};
use igdb_sync::api::ApiServer;
use igdb_sync::database_ops::db::Db;
use igdb_sync::database_ops::igdb::{IgdbClient, IgdbSyncConfig, SyncService};
use igdb_sync::database_ops::store::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
use igdb_sync::logging::{init_tracing, DEFAULT_FILTER};
use igdb_sync::util::env as env_util;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    tracing::info!("initializing igdb sync trigger server");

    env_util::preflight_check(
        "api_server",
        &["API_SECRET", "TWITCH_CLIENT_ID", "TWITCH_CLIENT_SECRET"],
        &["API_HOST", "API_PORT", "IGDB_BASE_URL", "IGDB_PAGE_SIZE", "DATABASE_URL"],
    )?;
    let server = ApiServer::from_env()?;
    let cfg = IgdbSyncConfig::from_env()?;

    // Without a database the server still runs, against the in-memory store.
    let db = match env_util::db_url() {
        Ok(database_url) => {
            let max_connections: u32 = env_util::env_parse("DB_MAX_CONNS", 4u32);
            Some(Db::connect(&database_url, max_connections).await?)
        }
        Err(_) => {
            tracing::warn!("no DATABASE_URL configured; runs will use the in-memory store");
            None
        }
    };
    let store: Arc<dyn CatalogStore> = match &db {
        Some(db) => Arc::new(PgCatalogStore::new(db.clone())),
        None => Arc::new(MemoryCatalogStore::new()),
    };

    let api = Arc::new(IgdbClient::new(cfg.clone()).context("building IGDB client")?);
    let service = Arc::new(SyncService::new(api, store, cfg));

    server.run(service, db).await
}
