use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use super::models::EntityKind;
use crate::util::env::{env_opt, env_req};

pub const DEFAULT_AUTH_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const DEFAULT_BASE_URL: &str = "https://api.igdb.com/v4";
const IGDB_MAX_LIMIT: usize = 500;

/// How similar-game ids on a record are turned into back-links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarGamesPolicy {
    /// Link the first already-local similar game, then stop scanning.
    FirstMatch,
    /// Link every already-local similar game.
    AllLocal,
}

impl SimilarGamesPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" | "first_match" | "one" => Some(Self::FirstMatch),
            "all" | "all_local" => Some(Self::AllLocal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IgdbSyncConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub base_url: String,
    pub endpoints: HashMap<EntityKind, String>,
    pub user_agent: String,
    /// Requests allowed per governor window; 0 disables the governor.
    pub max_requests: u32,
    pub cooldown: Duration,
    pub page_size: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub request_timeout: Duration,
    pub run_deadline: Option<Duration>,
    pub token_skew: Duration,
    pub min_rating: f64,
    pub min_votes: i64,
    pub similar_games: SimilarGamesPolicy,
    pub resolve_covers: bool,
    pub resolve_company_logos: bool,
}

impl Default for IgdbSyncConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoints: EntityKind::ALL
                .iter()
                .map(|k| (*k, k.default_endpoint().to_string()))
                .collect(),
            user_agent: "igdb-sync/0.1".to_string(),
            max_requests: 4,
            cooldown: Duration::from_millis(1000),
            page_size: 50,
            max_retries: 3,
            backoff_ms: 500,
            request_timeout: Duration::from_secs(30),
            run_deadline: None,
            token_skew: Duration::from_secs(30),
            min_rating: 0.0,
            min_votes: 0,
            similar_games: SimilarGamesPolicy::FirstMatch,
            resolve_covers: true,
            resolve_company_logos: true,
        }
    }
}

impl IgdbSyncConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.client_id = env_req("TWITCH_CLIENT_ID")
            .context("TWITCH_CLIENT_ID is required for IGDB sync")?;
        cfg.client_secret = env_req("TWITCH_CLIENT_SECRET")
            .context("TWITCH_CLIENT_SECRET is required for IGDB sync")?;
        if let Some(v) = env_opt("IGDB_AUTH_URL") {
            cfg.auth_url = v.trim().to_string();
        }
        if let Some(v) = env_opt("IGDB_BASE_URL") {
            cfg.base_url = v.trim().trim_end_matches('/').to_string();
        }
        for kind in EntityKind::ALL {
            let key = format!("IGDB_ENDPOINT_{}", kind.label().to_ascii_uppercase());
            if let Some(v) = env_opt(&key) {
                cfg.endpoints
                    .insert(kind, v.trim().trim_matches('/').to_string());
            }
        }
        if let Some(v) = env_opt("IGDB_USER_AGENT") {
            cfg.user_agent = v;
        }
        if let Some(n) = parse_env::<u32>("IGDB_MAX_REQUESTS") {
            cfg.max_requests = n;
        }
        if let Some(n) = parse_env::<u64>("IGDB_COOLDOWN_MS") {
            cfg.cooldown = Duration::from_millis(n);
        }
        if let Some(n) = parse_env::<usize>("IGDB_PAGE_SIZE") {
            cfg.page_size = n.clamp(1, IGDB_MAX_LIMIT);
        }
        if let Some(n) = parse_env::<u32>("IGDB_MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(n) = parse_env::<u64>("IGDB_BACKOFF_MS") {
            cfg.backoff_ms = n;
        }
        if let Some(n) = parse_env::<u64>("IGDB_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = Duration::from_secs(n.max(1));
        }
        if let Some(n) = parse_env::<u64>("IGDB_RUN_DEADLINE_SECS") {
            cfg.run_deadline = (n > 0).then(|| Duration::from_secs(n));
        }
        if let Some(n) = parse_env::<u64>("IGDB_TOKEN_SKEW_SECS") {
            cfg.token_skew = Duration::from_secs(n);
        }
        if let Some(n) = parse_env::<f64>("IGDB_MIN_RATING") {
            cfg.min_rating = n.max(0.0);
        }
        if let Some(n) = parse_env::<i64>("IGDB_MIN_VOTES") {
            cfg.min_votes = n.max(0);
        }
        if let Some(v) = env_opt("IGDB_SIMILAR_GAMES") {
            match SimilarGamesPolicy::parse(&v) {
                Some(policy) => cfg.similar_games = policy,
                None => warn!(
                    target = "igdb",
                    raw_value = %v,
                    "IGDB_SIMILAR_GAMES not recognised; keeping first-match policy"
                ),
            }
        }
        if let Some(v) = env_opt("IGDB_RESOLVE_COVERS") {
            cfg.resolve_covers = parse_flag(&v);
        }
        if let Some(v) = env_opt("IGDB_RESOLVE_COMPANY_LOGOS") {
            cfg.resolve_company_logos = parse_flag(&v);
        }
        Ok(cfg)
    }

    pub fn endpoint_url(&self, kind: EntityKind) -> String {
        let path = self
            .endpoints
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_endpoint());
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, IGDB_MAX_LIMIT)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(
                target = "igdb",
                env_key = key,
                raw_value = %raw,
                "invalid numeric env value; using default"
            );
            None
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
