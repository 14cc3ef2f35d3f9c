#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use igdb_sync::database_ops::igdb::{
    CatalogApi, CatalogPageQuery, CatalogRecord, EntityKind, IgdbSyncConfig, SearchType,
    SyncError,
};
use igdb_sync::database_ops::store::{
    CatalogStore, GameAggregate, GameRow, LocalizationDraft, MemoryCatalogStore, NewReference,
    RunStatus, RunTotals, StoreError,
};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub fn record(id: i64, updated_at: i64) -> CatalogRecord {
    CatalogRecord {
        id,
        name: Some(format!("Game {id}")),
        updated_at: Some(updated_at),
        created_at: Some(updated_at - 1_000),
        ..Default::default()
    }
}

pub fn named(id: i64, name: &str) -> Value {
    json!({"id": id, "name": name, "slug": name.to_ascii_lowercase()})
}

pub fn config(page_size: usize) -> IgdbSyncConfig {
    IgdbSyncConfig {
        client_id: "client".into(),
        client_secret: "secret".into(),
        page_size,
        max_requests: 0,
        backoff_ms: 1,
        ..Default::default()
    }
}

/// Scripted upstream catalog. Pages are sliced out of `records` by offset and limit, entities are
/// served from a map keyed by kind and id, and every call is counted.
#[derive(Default)]
pub struct FakeCatalog {
    records: Mutex<Vec<Value>>,
    entities: Mutex<HashMap<(EntityKind, i64), Value>>,
    failing: Mutex<HashMap<(EntityKind, i64), u16>>,
    calls: Mutex<HashMap<EntityKind, usize>>,
    page_queries: Mutex<Vec<CatalogPageQuery>>,
    page_error: Mutex<Option<u16>>,
    reject_auth: AtomicBool,
    auth_calls: Mutex<usize>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_records(&self, records: Vec<CatalogRecord>) {
        let rows = records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect();
        self.set_rows(rows);
    }

    /// Serve page rows verbatim, malformed ones included.
    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.records.lock().unwrap() = rows;
    }

    /// Stop failing `kind`/`id`.
    pub fn heal(&self, kind: EntityKind, id: i64) {
        self.failing.lock().unwrap().remove(&(kind, id));
    }

    /// Serve `payload` for `kind`; the id is read from the payload.
    pub fn entity(&self, kind: EntityKind, payload: Value) {
        let id = payload["id"].as_i64().expect("entity payload needs an id");
        self.entities.lock().unwrap().insert((kind, id), payload);
    }

    pub fn fail(&self, kind: EntityKind, id: i64, status: u16) {
        self.failing.lock().unwrap().insert((kind, id), status);
    }

    pub fn fail_pages(&self, status: u16) {
        *self.page_error.lock().unwrap() = Some(status);
    }

    pub fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    /// Hold every page fetch until the semaphore hands out a permit.
    pub fn gate_pages(&self, gate: Arc<Semaphore>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn calls(&self, kind: EntityKind) -> usize {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// Entity fetches across every kind; page fetches are not included.
    pub fn entity_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn page_queries(&self) -> Vec<CatalogPageQuery> {
        self.page_queries.lock().unwrap().clone()
    }

    pub fn auth_calls(&self) -> usize {
        *self.auth_calls.lock().unwrap()
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn authenticate(&self) -> Result<(), SyncError> {
        *self.auth_calls.lock().unwrap() += 1;
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(SyncError::Auth {
                status: Some(400),
                message: "invalid client secret".into(),
            });
        }
        Ok(())
    }

    async fn fetch_page(&self, query: &CatalogPageQuery) -> Result<Vec<Value>, SyncError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        self.page_queries.lock().unwrap().push(query.clone());
        if let Some(status) = *self.page_error.lock().unwrap() {
            return Err(SyncError::Upstream {
                kind: EntityKind::Game,
                id: None,
                status,
            });
        }
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn fetch_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<Value>, SyncError> {
        *self.calls.lock().unwrap().entry(kind).or_default() += 1;
        if let Some(status) = self.failing.lock().unwrap().get(&(kind, id)) {
            return Err(SyncError::Upstream {
                kind,
                id: Some(id),
                status: *status,
            });
        }
        Ok(self.entities.lock().unwrap().get(&(kind, id)).cloned())
    }
}

/// Memory store whose Game upserts fail for selected external ids.
pub struct FlakyStore {
    pub inner: Arc<MemoryCatalogStore>,
    pub fail_games: HashSet<i64>,
    /// Make `begin_run` fail, as an unreachable database would.
    pub fail_begin_run: bool,
}

impl FlakyStore {
    pub fn failing_games(inner: Arc<MemoryCatalogStore>, ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            inner,
            fail_games: ids.into_iter().collect(),
            fail_begin_run: false,
        }
    }
}

#[async_trait]
impl CatalogStore for FlakyStore {
    async fn find_reference(
        &self,
        kind: EntityKind,
        external_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        self.inner.find_reference(kind, external_id).await
    }

    async fn insert_reference(&self, row: &NewReference) -> Result<i64, StoreError> {
        self.inner.insert_reference(row).await
    }

    async fn find_localization(
        &self,
        external_id: i64,
    ) -> Result<Option<LocalizationDraft>, StoreError> {
        self.inner.find_localization(external_id).await
    }

    async fn find_game(&self, external_id: i64) -> Result<Option<GameRow>, StoreError> {
        self.inner.find_game(external_id).await
    }

    async fn upsert_game_aggregate(&self, game: &GameAggregate) -> Result<i64, StoreError> {
        if self.fail_games.contains(&game.external_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert_game_aggregate(game).await
    }

    async fn begin_run(
        &self,
        search_type: SearchType,
        started_from: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        if self.fail_begin_run {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.begin_run(search_type, started_from).await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        totals: &RunTotals,
    ) -> Result<(), StoreError> {
        self.inner.finish_run(run_id, status, totals).await
    }

    async fn last_watermark(
        &self,
        search_type: SearchType,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_watermark(search_type).await
    }
}

/// Poll until `done` holds, giving up after a couple of seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
