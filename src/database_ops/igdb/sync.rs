use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregate::{AggregateBuilder, BuildOutcome};
use super::client::CatalogApi;
use super::config::IgdbSyncConfig;
use super::error::SyncError;
use super::models::{unix_to_utc, CatalogRecord, EntityKind, SearchType};
use super::query::CatalogPageQuery;
use super::resolver::{EntityResolver, ResolverSnapshot};
use crate::database_ops::store::{CatalogStore, RunStatus, RunTotals};

const MAX_REPORTED_FAILURES: usize = 50;

/// Watermark used when neither the caller nor a previous run supplies one.
pub fn default_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriverState {
    Idle,
    Authenticating,
    FetchingPage { offset: usize },
    ProcessingPage { offset: usize, records: usize },
    Done,
}

/// Parameters of one run, as handed over by the trigger.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// `None` resumes from the last successful run's watermark.
    pub start: Option<DateTime<Utc>>,
    pub search_type: SearchType,
    pub min_rating: Option<f64>,
    pub min_votes: Option<i64>,
}

impl SyncRequest {
    pub fn new(start: Option<DateTime<Utc>>, search_type: SearchType) -> Self {
        Self {
            start,
            search_type,
            min_rating: None,
            min_votes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    /// `None` when the row was too malformed to carry an id.
    pub external_id: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// `None` when the run could not be recorded in the store.
    pub run_id: Option<Uuid>,
    pub search_type: SearchType,
    pub started_from: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub pages: u64,
    pub fetched: u64,
    pub upserted: u64,
    pub skipped_unchanged: u64,
    pub failed: u64,
    pub omitted_entities: u64,
    pub watermark: Option<DateTime<Utc>>,
    pub failures: Vec<RecordFailure>,
    pub error: Option<String>,
    pub resolver: ResolverSnapshot,
}

impl SyncReport {
    fn new(search_type: SearchType, started_from: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            search_type,
            started_from,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            pages: 0,
            fetched: 0,
            upserted: 0,
            skipped_unchanged: 0,
            failed: 0,
            omitted_entities: 0,
            watermark: None,
            failures: Vec::new(),
            error: None,
            resolver: ResolverSnapshot::default(),
        }
    }

    fn totals(&self) -> RunTotals {
        RunTotals {
            pages: self.pages,
            fetched: self.fetched,
            upserted: self.upserted,
            skipped_unchanged: self.skipped_unchanged,
            failed: self.failed,
            watermark: self.watermark,
            error: self.error.clone(),
        }
    }
}

/// High-water mark that never moves past a record that failed, so the next run retries it.
#[derive(Debug, Default)]
struct Watermark {
    highest_seen: Option<DateTime<Utc>>,
    earliest_failed: Option<DateTime<Utc>>,
}

impl Watermark {
    fn seen(&mut self, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            self.highest_seen = Some(self.highest_seen.map_or(ts, |h| h.max(ts)));
        }
    }

    fn failed(&mut self, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            self.earliest_failed = Some(self.earliest_failed.map_or(ts, |f| f.min(ts)));
        }
    }

    /// Latest instant known to be safe to resume from.
    fn floor(&self, since: DateTime<Utc>) -> DateTime<Utc> {
        self.highest_seen.unwrap_or(since)
    }

    fn value(&self) -> Option<DateTime<Utc>> {
        match (self.highest_seen, self.earliest_failed) {
            (Some(high), Some(failed)) => Some(high.min(failed)),
            (high, None) => high,
            (None, failed) => failed,
        }
    }
}

/// Pages through changed catalog records and feeds each to the aggregate builder.
///
/// `Idle -> Authenticating -> FetchingPage -> ProcessingPage -> (FetchingPage | Done)`.
pub struct SyncDriver {
    api: Arc<dyn CatalogApi>,
    builder: Arc<AggregateBuilder>,
    store: Arc<dyn CatalogStore>,
    page_size: usize,
    min_rating: f64,
    min_votes: i64,
    run_deadline: Option<Duration>,
    state: DriverState,
    observer: Option<watch::Sender<DriverState>>,
    report: Option<SyncReport>,
}

impl SyncDriver {
    pub fn new(api: Arc<dyn CatalogApi>, builder: Arc<AggregateBuilder>, cfg: &IgdbSyncConfig) -> Self {
        let store = builder.resolver().store().clone();
        Self {
            api,
            builder,
            store,
            page_size: cfg.effective_page_size(),
            min_rating: cfg.min_rating,
            min_votes: cfg.min_votes,
            run_deadline: cfg.run_deadline,
            state: DriverState::Idle,
            observer: None,
            report: None,
        }
    }

    /// Publish every state transition on `tx`.
    pub fn with_observer(mut self, tx: watch::Sender<DriverState>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Report of the last run, including runs that ended with an error.
    pub fn report(&self) -> Option<&SyncReport> {
        self.report.as_ref()
    }

    fn transition(&mut self, next: DriverState) {
        debug!(target = "igdb", from = ?self.state, to = ?next, "sync state transition");
        self.state = next;
        if let Some(tx) = &self.observer {
            tx.send_replace(next);
        }
    }

    /// Execute one run. The report is kept on the driver whether or not the run succeeded,
    /// including runs that could not be recorded in the store.
    pub async fn run(&mut self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.transition(DriverState::Idle);
        let mut report = SyncReport::new(
            request.search_type,
            request.start.unwrap_or_else(default_start),
        );

        let outcome = match self.open_run(request, &mut report).await {
            Ok(()) => {
                let since = report.started_from;
                self.drive(request, since, &mut report).await
            }
            Err(err) => Err(err),
        };
        report.resolver = self.builder.resolver().snapshot();
        report.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => report.status = RunStatus::Succeeded,
            Err(err) => {
                report.status = RunStatus::Failed;
                report.error = Some(err.to_string());
            }
        }
        if let Some(run_id) = report.run_id {
            if let Err(err) = self.store.finish_run(run_id, report.status, &report.totals()).await {
                warn!(target = "igdb", %run_id, error = %err, "failed to record run completion");
            }
        }
        self.transition(DriverState::Done);

        match &outcome {
            Ok(()) => info!(
                target = "igdb",
                run_id = ?report.run_id,
                pages = report.pages,
                fetched = report.fetched,
                upserted = report.upserted,
                skipped = report.skipped_unchanged,
                failed = report.failed,
                watermark = ?report.watermark,
                "igdb sync run finished"
            ),
            Err(err) => error!(
                target = "igdb",
                run_id = ?report.run_id,
                error = %err,
                "igdb sync run aborted"
            ),
        }
        self.report = Some(report.clone());
        outcome.map(|_| report)
    }

    /// Resolve the starting watermark and record the run.
    async fn open_run(&self, request: &SyncRequest, report: &mut SyncReport) -> Result<(), SyncError> {
        if request.start.is_none() {
            if let Some(mark) = self.store.last_watermark(request.search_type).await? {
                report.started_from = mark;
            }
        }
        let run_id = self
            .store
            .begin_run(request.search_type, report.started_from)
            .await?;
        report.run_id = Some(run_id);
        info!(
            target = "igdb",
            %run_id,
            search_type = %request.search_type,
            since = %report.started_from,
            page_size = self.page_size,
            "igdb sync run started"
        );
        Ok(())
    }

    async fn drive(
        &mut self,
        request: &SyncRequest,
        since: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let deadline = self.run_deadline.map(|d| Instant::now() + d);
        let check_deadline = || match deadline {
            Some(at) if Instant::now() >= at => Err(SyncError::DeadlineExceeded),
            _ => Ok(()),
        };

        self.transition(DriverState::Authenticating);
        self.api.authenticate().await?;

        let mut watermark = Watermark::default();
        let mut offset = 0usize;
        loop {
            check_deadline()?;
            self.transition(DriverState::FetchingPage { offset });
            let query = CatalogPageQuery {
                search_type: request.search_type,
                since,
                min_rating: request.min_rating.unwrap_or(self.min_rating).max(0.0),
                min_votes: request.min_votes.unwrap_or(self.min_votes).max(0),
                limit: self.page_size,
                offset,
            };
            let page = self.api.fetch_page(&query).await?;
            report.pages += 1;
            report.fetched += page.len() as u64;

            self.transition(DriverState::ProcessingPage {
                offset,
                records: page.len(),
            });
            for row in &page {
                check_deadline()?;
                self.process(row, request.search_type, since, report, &mut watermark)
                    .await?;
            }
            report.watermark = watermark.value();

            if page.len() < self.page_size {
                debug!(target = "igdb", offset, rows = page.len(), "short page; run complete");
                return Ok(());
            }
            offset += self.page_size;
        }
    }

    /// Record-level failures are logged and counted; only run-fatal errors are returned.
    async fn process(
        &self,
        row: &Value,
        search_type: SearchType,
        since: DateTime<Utc>,
        report: &mut SyncReport,
        watermark: &mut Watermark,
    ) -> Result<(), SyncError> {
        let record = match CatalogRecord::from_row(row) {
            Ok(record) => record,
            Err(source) => {
                let external_id = row.get("id").and_then(Value::as_i64);
                let ts = row
                    .get(search_type.field())
                    .and_then(Value::as_i64)
                    .and_then(unix_to_utc)
                    .unwrap_or_else(|| watermark.floor(since));
                let err = SyncError::Parse {
                    kind: EntityKind::Game,
                    id: external_id,
                    source,
                };
                record_failure(external_id, Some(ts), &err, report, watermark);
                return Ok(());
            }
        };

        let ts = record.timestamp_for(search_type);
        match self.builder.build_and_upsert(&record).await {
            Ok(BuildOutcome::Upserted { omitted, .. }) => {
                report.upserted += 1;
                report.omitted_entities += omitted as u64;
                watermark.seen(ts);
            }
            Ok(BuildOutcome::Unchanged { .. }) => {
                report.skipped_unchanged += 1;
                watermark.seen(ts);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => record_failure(Some(record.id), ts, &err, report, watermark),
        }
        Ok(())
    }
}

fn record_failure(
    external_id: Option<i64>,
    ts: Option<DateTime<Utc>>,
    err: &SyncError,
    report: &mut SyncReport,
    watermark: &mut Watermark,
) {
    report.failed += 1;
    watermark.failed(ts);
    error!(
        target = "igdb",
        external_id = ?external_id,
        error = %err,
        "failed to sync game; continuing with next record"
    );
    if report.failures.len() < MAX_REPORTED_FAILURES {
        report.failures.push(RecordFailure {
            external_id,
            error: err.to_string(),
        });
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a sync run is already in progress")]
    Busy,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub state: DriverState,
    pub last_report: Option<SyncReport>,
}

/// Owns the long-lived pipeline pieces and serializes runs onto a single worker.
///
/// The resolver (and its memo) outlives individual runs.
pub struct SyncService {
    api: Arc<dyn CatalogApi>,
    builder: Arc<AggregateBuilder>,
    cfg: IgdbSyncConfig,
    worker: Arc<Mutex<()>>,
    state_tx: watch::Sender<DriverState>,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncService {
    pub fn new(api: Arc<dyn CatalogApi>, store: Arc<dyn CatalogStore>, cfg: IgdbSyncConfig) -> Self {
        let resolver = EntityResolver::new(api.clone(), store)
            .with_company_logos(cfg.resolve_company_logos);
        let builder = AggregateBuilder::new(Arc::new(resolver))
            .with_similar_games(cfg.similar_games)
            .with_covers(cfg.resolve_covers);
        let (state_tx, _) = watch::channel(DriverState::Idle);
        Self {
            api,
            builder: Arc::new(builder),
            cfg,
            worker: Arc::new(Mutex::new(())),
            state_tx,
            last_report: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &IgdbSyncConfig {
        &self.cfg
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        self.builder.resolver()
    }

    /// Run to completion on the caller's task, waiting for any in-flight run first.
    pub async fn run_sync(&self, request: SyncRequest) -> Result<SyncReport, SyncError> {
        let _worker = self.worker.lock().await;
        self.execute(&request).await
    }

    /// Trigger entry point: authenticate up front so credential problems are reported to the
    /// caller, then run in the background. Rejects the call while another run is active.
    pub async fn start(self: &Arc<Self>, request: SyncRequest) -> Result<(), TriggerError> {
        let guard = self
            .worker
            .clone()
            .try_lock_owned()
            .map_err(|_| TriggerError::Busy)?;
        self.api.authenticate().await?;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = service.execute(&request).await {
                error!(
                    target = "igdb",
                    search_type = %request.search_type,
                    error = %err,
                    "background igdb sync failed"
                );
            }
        });
        Ok(())
    }

    async fn execute(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        let mut driver = SyncDriver::new(self.api.clone(), self.builder.clone(), &self.cfg)
            .with_observer(self.state_tx.clone());
        let result = driver.run(request).await;
        if let Some(report) = driver.report() {
            *self.last_report.write().await = Some(report.clone());
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.worker.try_lock().is_err()
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            running: self.is_running(),
            state: *self.state_tx.borrow(),
            last_report: self.last_report.read().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs, 0).single()
    }

    #[test]
    fn watermark_tracks_highest_seen() {
        let mut w = Watermark::default();
        w.seen(at(100));
        w.seen(at(300));
        w.seen(at(200));
        w.seen(None);
        assert_eq!(w.value(), at(300));
    }

    #[test]
    fn watermark_holds_back_at_first_failure() {
        let mut w = Watermark::default();
        w.seen(at(100));
        w.failed(at(150));
        w.seen(at(300));
        w.failed(at(250));
        assert_eq!(w.value(), at(150));
    }

    #[test]
    fn default_start_is_2020() {
        assert_eq!(default_start().to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }
}
