use anyhow::{anyhow, Context, Result};
use clap::Parser;
use igdb_sync::database_ops::db::Db;
use igdb_sync::database_ops::igdb::models::parse_timestamp;
use igdb_sync::database_ops::igdb::{
    IgdbClient, IgdbSyncConfig, SearchType, SyncRequest, SyncService,
};
use igdb_sync::database_ops::store::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
use igdb_sync::logging::{init_tracing, DEFAULT_FILTER};
use igdb_sync::util::env;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "igdb_sync", version, about = "Incremental IGDB catalog sync")]
struct Cli {
    /// Watermark to sync from (RFC 3339, YYYY-MM-DD or unix seconds).
    /// Defaults to the last successful run's high-water mark.
    #[arg(long, value_parser = parse_timestamp)]
    since: Option<chrono::DateTime<chrono::Utc>>,
    /// Timestamp field to filter and sort by: updated_at or created_at
    #[arg(long, default_value = "updated_at", value_parser = parse_search_type)]
    search_type: SearchType,
    /// Only games with total_rating strictly above this value
    #[arg(long)]
    min_rating: Option<f64>,
    /// Only games with total_rating_count strictly above this value
    #[arg(long)]
    min_votes: Option<i64>,
    /// Run the whole pipeline against an in-memory store; nothing is written to Postgres
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Print the run report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_search_type(raw: &str) -> std::result::Result<SearchType, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    env::preflight_check(
        "igdb_sync",
        &["TWITCH_CLIENT_ID", "TWITCH_CLIENT_SECRET"],
        &[
            "IGDB_BASE_URL",
            "IGDB_MAX_REQUESTS",
            "IGDB_COOLDOWN_MS",
            "IGDB_PAGE_SIZE",
            "IGDB_RUN_DEADLINE_SECS",
            "IGDB_SIMILAR_GAMES",
            "DATABASE_URL",
        ],
    )?;
    let cfg = IgdbSyncConfig::from_env()?;

    let store: Arc<dyn CatalogStore> = if cli.dry_run {
        info!(target = "igdb", "dry run: using in-memory store");
        Arc::new(MemoryCatalogStore::new())
    } else {
        let database_url = env::db_url()?;
        let max_conns: u32 = env::env_parse("DB_MAX_CONNS", 4u32);
        let db = Db::connect(&database_url, max_conns).await?;
        Arc::new(PgCatalogStore::new(db))
    };

    let api = Arc::new(IgdbClient::new(cfg.clone()).context("building IGDB client")?);
    let service = SyncService::new(api, store, cfg);

    let request = SyncRequest {
        start: cli.since,
        search_type: cli.search_type,
        min_rating: cli.min_rating,
        min_votes: cli.min_votes,
    };
    let report = service
        .run_sync(request)
        .await
        .map_err(|err| anyhow!("igdb sync failed: {err}"))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "run {} ({}) from {}: pages={} fetched={} upserted={} unchanged={} failed={} watermark={}",
            report
                .run_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            report.search_type,
            report.started_from.to_rfc3339(),
            report.pages,
            report.fetched,
            report.upserted,
            report.skipped_unchanged,
            report.failed,
            report
                .watermark
                .map(|w| w.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
        for failure in &report.failures {
            let id = failure
                .external_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            println!("  failed game {id}: {}", failure.error);
        }
    }
    Ok(())
}
