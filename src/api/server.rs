// Trigger server for the IGDB sync pipeline.

use crate::api::handlers::AppState;
use crate::api::{auth, middleware, routes};
use crate::database_ops::db::Db;
use crate::database_ops::igdb::SyncService;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;

use crate::util::env::{env_opt, env_req};

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub api_secret: String,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        let host = env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_opt("API_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .trim()
            .parse()
            .context("Invalid API_PORT")?;
        let api_secret =
            env_req("API_SECRET").context("API_SECRET environment variable is required")?;

        Ok(Self {
            host,
            port,
            api_secret,
        })
    }

    /// Start the HTTP server
    pub async fn run(self, service: Arc<SyncService>, db: Option<Db>) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            store = if db.is_some() { "postgres" } else { "memory" },
            "starting igdb sync trigger server"
        );

        let state = web::Data::new(AppState {
            service,
            db,
            started_at: Instant::now(),
        });
        let api_secret = self.api_secret.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(auth)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
