// API request/response models (DTOs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database_ops::igdb::SearchType;

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// "connected", "disconnected" or "memory" when running without Postgres.
    pub database: String,
    pub uptime_seconds: u64,
    pub sync_running: bool,
}

/// Body of `POST /api/v1/igdb/sync`. Every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncTriggerRequest {
    /// RFC 3339, `YYYY-MM-DD` or unix seconds; omitted means "resume from last watermark".
    #[serde(default)]
    pub start: Option<String>,
    /// `updated_at` (default) or `created_at`.
    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub min_votes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAccepted {
    pub status: String,
    pub search_type: SearchType,
    pub start: Option<DateTime<Utc>>,
}
