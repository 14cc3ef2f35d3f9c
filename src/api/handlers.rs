// HTTP request handlers for API endpoints

use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;
use std::time::Instant;

use crate::api::models::*;
use crate::database_ops::db::Db;
use crate::database_ops::igdb::models::parse_timestamp;
use crate::database_ops::igdb::{SearchType, SyncError, SyncRequest, SyncService, TriggerError};

/// Shared state handed to every handler.
pub struct AppState {
    pub service: Arc<SyncService>,
    /// `None` when the pipeline writes to the in-memory store.
    pub db: Option<Db>,
    pub started_at: Instant,
}

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let db_status = match &state.db {
        Some(db) => match sqlx::query_scalar::<_, bool>("SELECT true")
            .persistent(false)
            .fetch_one(&db.pool)
            .await
        {
            Ok(_) => "connected",
            Err(_) => "disconnected",
        },
        None => "memory",
    };

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: db_status.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sync_running: state.service.is_running(),
    });
    Ok(HttpResponse::Ok().json(response))
}

fn build_request(payload: &SyncTriggerRequest) -> std::result::Result<SyncRequest, String> {
    let search_type = match payload.search_type.as_deref() {
        Some(raw) => raw.parse::<SearchType>()?,
        None => SearchType::UpdatedAt,
    };
    let start = payload.start.as_deref().map(parse_timestamp).transpose()?;
    Ok(SyncRequest {
        start,
        search_type,
        min_rating: payload.min_rating.map(|r| r.max(0.0)),
        min_votes: payload.min_votes.map(|v| v.max(0)),
    })
}

/// Start a sync run in the background.
///
/// 202 once the credential exchange succeeded and the run is scheduled, 409 while another run is
/// active, 502 when the upstream rejects our credentials.
pub async fn trigger_sync(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        SyncTriggerRequest::default()
    } else {
        match serde_json::from_slice::<SyncTriggerRequest>(&body) {
            Ok(p) => p,
            Err(err) => {
                return Ok(HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("invalid request body: {err}"))));
            }
        }
    };
    let request = match build_request(&payload) {
        Ok(r) => r,
        Err(msg) => {
            return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(msg)));
        }
    };
    tracing::info!(
        target = "igdb",
        search_type = %request.search_type,
        start = ?request.start,
        min_rating = ?request.min_rating,
        min_votes = ?request.min_votes,
        "sync trigger requested"
    );

    let accepted = SyncAccepted {
        status: "started".to_string(),
        search_type: request.search_type,
        start: request.start,
    };
    match state.service.start(request).await {
        Ok(()) => Ok(HttpResponse::Accepted().json(ApiResponse::success(accepted))),
        Err(TriggerError::Busy) => Ok(HttpResponse::Conflict()
            .json(ApiResponse::<()>::error(TriggerError::Busy.to_string()))),
        Err(TriggerError::Sync(err @ SyncError::Auth { .. })) => {
            tracing::error!(target = "igdb", error = %err, "sync could not start");
            Ok(HttpResponse::BadGateway().json(ApiResponse::<()>::error(err.to_string())))
        }
        Err(TriggerError::Sync(err)) => {
            tracing::error!(target = "igdb", error = %err, "sync could not start");
            Ok(HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(err.to_string())))
        }
    }
}

pub async fn sync_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let status = state.service.status().await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trigger_defaults_to_updated_at_and_watermark() {
        let req = build_request(&SyncTriggerRequest::default()).unwrap();
        assert_eq!(req.search_type, SearchType::UpdatedAt);
        assert!(req.start.is_none());
    }

    #[test]
    fn negative_thresholds_are_clamped() {
        let payload = SyncTriggerRequest {
            min_rating: Some(-5.0),
            min_votes: Some(-3),
            ..Default::default()
        };
        let req = build_request(&payload).unwrap();
        assert_eq!(req.min_rating, Some(0.0));
        assert_eq!(req.min_votes, Some(0));

        let payload = SyncTriggerRequest {
            min_rating: Some(70.0),
            min_votes: Some(10),
            ..Default::default()
        };
        let req = build_request(&payload).unwrap();
        assert_eq!(req.min_rating, Some(70.0));
        assert_eq!(req.min_votes, Some(10));
    }

    #[test]
    fn bad_search_type_is_rejected() {
        let payload = SyncTriggerRequest {
            search_type: Some("first_release_date".into()),
            ..Default::default()
        };
        assert!(build_request(&payload).is_err());
    }
}
