use thiserror::Error;

use super::models::EntityKind;
use crate::database_ops::store::StoreError;

/// Failure taxonomy of the sync pipeline.
///
/// `Auth` and `DeadlineExceeded` end the run. `Upstream`, `Transport` and `Parse` are scoped to
/// the entity being resolved and make it "unavailable" to the caller. `Persistence` aborts the
/// Game whose transaction failed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed{}: {message}", .status.map(|s| format!(" (status={s})")).unwrap_or_default())]
    Auth {
        status: Option<u16>,
        message: String,
    },

    #[error("upstream {kind} request failed (id={}, status={status})", .id.map(|i| i.to_string()).unwrap_or_else(|| "-".into()))]
    Upstream {
        kind: EntityKind,
        id: Option<i64>,
        status: u16,
    },

    #[error("transport error talking to {kind} endpoint: {source}")]
    Transport {
        kind: EntityKind,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse {kind} payload (id={}): {source}", .id.map(|i| i.to_string()).unwrap_or_else(|| "-".into()))]
    Parse {
        kind: EntityKind,
        id: Option<i64>,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("sync run deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors that stop the whole run rather than a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth { .. } | SyncError::DeadlineExceeded | SyncError::Config(_)
        )
    }

    /// Errors that only make one sub-entity unavailable.
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::Upstream { .. } | SyncError::Transport { .. } | SyncError::Parse { .. }
        )
    }

    /// Transport failures, 5xx and 429 get another attempt; other 4xx and empty results don't.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { .. } => true,
            SyncError::Upstream { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: u16) -> SyncError {
        SyncError::Upstream {
            kind: EntityKind::Genre,
            id: Some(12),
            status,
        }
    }

    #[test]
    fn classifies_retryable_statuses() {
        assert!(upstream(500).is_retryable());
        assert!(upstream(503).is_retryable());
        assert!(upstream(429).is_retryable());
        assert!(!upstream(400).is_retryable());
        assert!(!upstream(404).is_retryable());
    }

    #[test]
    fn auth_is_fatal_and_upstream_is_not() {
        let auth = SyncError::Auth {
            status: Some(401),
            message: "bad secret".into(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_entity_scoped());
        assert!(!upstream(500).is_fatal());
        assert!(upstream(500).is_entity_scoped());
    }

    #[test]
    fn upstream_message_names_kind_and_id() {
        let msg = upstream(404).to_string();
        assert!(msg.contains("genre"), "{msg}");
        assert!(msg.contains("id=12"), "{msg}");
        assert!(msg.contains("status=404"), "{msg}");
    }
}
