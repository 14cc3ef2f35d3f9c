//! Local catalog store consumed by the sync pipeline.
//!
//! Reference rows are keyed by `(kind, external_id)` with a uniqueness constraint behind them;
//! a Game is written as one aggregate in a single transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::database_ops::igdb::models::{EntityKind, SearchType};

pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness violation on `(kind, external_id)`: someone else persisted it first.
    #[error("{kind} with external id {external_id} already exists")]
    Conflict { kind: EntityKind, external_id: i64 },

    #[error("{0} is not stored as a standalone reference row")]
    UnsupportedKind(EntityKind),

    #[error("unknown sync run {0}")]
    UnknownRun(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A reference row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub kind: EntityKind,
    pub external_id: i64,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Upstream payload with its identity stripped.
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameRow {
    pub id: i64,
    pub external_id: i64,
    pub title: String,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalizationDraft {
    pub external_id: i64,
    pub name: Option<String>,
    pub region_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvolvementDraft {
    pub external_id: i64,
    pub company_id: i64,
    pub developer: bool,
    pub publisher: bool,
    pub porter: bool,
    pub supporter: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseDateDraft {
    pub external_id: i64,
    pub date: DateTime<Utc>,
    pub platform_id: i64,
    pub region_id: i64,
}

/// Fully resolved Game ready to be persisted in one transaction.
///
/// `associations` holds local reference ids per kind; each list replaces whatever the Game was
/// linked to before. Localizations are upserted by external id and never deleted. Involvements
/// and release dates are upserted by external id; stored rows of this Game that are no longer
/// listed are removed unless their id appears in `unavailable`.
#[derive(Debug, Clone, Default)]
pub struct GameAggregate {
    pub external_id: i64,
    pub title: String,
    pub slug: Option<String>,
    pub summary: Option<String>,
    pub storyline: Option<String>,
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub cover_url: Option<String>,
    pub first_release_date: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
    pub associations: BTreeMap<EntityKind, Vec<i64>>,
    pub localizations: Vec<LocalizationDraft>,
    pub involvements: Vec<InvolvementDraft>,
    pub release_dates: Vec<ReleaseDateDraft>,
    /// Local ids of already-known similar games; linked in both directions.
    pub similar_game_ids: Vec<i64>,
    /// External ids per kind that were listed but could not be resolved during this build.
    pub unavailable: BTreeMap<EntityKind, Vec<i64>>,
}

impl GameAggregate {
    /// External ids of `kind` whose stored rows must survive this write.
    pub fn unavailable_ids(&self, kind: EntityKind) -> &[i64] {
        self.unavailable.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Counters written when a run finishes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub pages: u64,
    pub fetched: u64,
    pub upserted: u64,
    pub skipped_unchanged: u64,
    pub failed: u64,
    pub watermark: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_reference(&self, kind: EntityKind, external_id: i64)
        -> Result<Option<i64>, StoreError>;

    /// Insert a reference row; `StoreError::Conflict` when the external id is already taken.
    async fn insert_reference(&self, row: &NewReference) -> Result<i64, StoreError>;

    /// Stored localization by its IGDB id, whichever Game it is attached to.
    async fn find_localization(
        &self,
        external_id: i64,
    ) -> Result<Option<LocalizationDraft>, StoreError>;

    async fn find_game(&self, external_id: i64) -> Result<Option<GameRow>, StoreError>;

    /// Local id of a Game if it exists; used for similar-game back-links.
    async fn find_game_id(&self, external_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(self.find_game(external_id).await?.map(|g| g.id))
    }

    /// Create or update a Game and everything it owns as one atomic unit.
    async fn upsert_game_aggregate(&self, game: &GameAggregate) -> Result<i64, StoreError>;

    async fn begin_run(
        &self,
        search_type: SearchType,
        started_from: DateTime<Utc>,
    ) -> Result<Uuid, StoreError>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        totals: &RunTotals,
    ) -> Result<(), StoreError>;

    /// High-water mark of the latest successful run for this search type.
    async fn last_watermark(
        &self,
        search_type: SearchType,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}
