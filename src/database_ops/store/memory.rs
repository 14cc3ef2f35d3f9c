use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    CatalogStore, GameAggregate, GameRow, InvolvementDraft, LocalizationDraft, NewReference,
    ReleaseDateDraft, RunStatus, RunTotals, StoreError,
};
use crate::database_ops::igdb::models::{EntityKind, SearchType};

#[derive(Debug, Clone)]
pub struct StoredReference {
    pub id: i64,
    pub row: NewReference,
}

#[derive(Debug, Clone)]
pub struct StoredGame {
    pub id: i64,
    pub aggregate: GameAggregate,
}

#[derive(Debug, Clone)]
pub struct StoredRun {
    pub id: Uuid,
    pub search_type: SearchType,
    pub started_from: DateTime<Utc>,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    references: HashMap<(EntityKind, i64), StoredReference>,
    games: BTreeMap<i64, StoredGame>,
    /// Undirected similar-game edges, stored as (min, max) local ids.
    similar: BTreeSet<(i64, i64)>,
    runs: Vec<StoredRun>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store with the same uniqueness rules as the Postgres schema.
///
/// Backs `--dry-run` and the pipeline tests.
#[derive(Default)]
pub struct MemoryCatalogStore {
    inner: Mutex<Inner>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reference_count(&self, kind: EntityKind) -> usize {
        self.lock()
            .references
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn reference(&self, kind: EntityKind, external_id: i64) -> Option<StoredReference> {
        self.lock().references.get(&(kind, external_id)).cloned()
    }

    pub fn game_count(&self) -> usize {
        self.lock().games.len()
    }

    pub fn game(&self, external_id: i64) -> Option<StoredGame> {
        self.lock().games.get(&external_id).cloned()
    }

    pub fn association(&self, external_id: i64, kind: EntityKind) -> Vec<i64> {
        self.lock()
            .games
            .get(&external_id)
            .and_then(|g| g.aggregate.associations.get(&kind).cloned())
            .unwrap_or_default()
    }

    pub fn localizations(&self, external_id: i64) -> Vec<LocalizationDraft> {
        self.game(external_id)
            .map(|g| g.aggregate.localizations)
            .unwrap_or_default()
    }

    pub fn involvements(&self, external_id: i64) -> Vec<InvolvementDraft> {
        self.game(external_id)
            .map(|g| g.aggregate.involvements)
            .unwrap_or_default()
    }

    pub fn release_dates(&self, external_id: i64) -> Vec<ReleaseDateDraft> {
        self.game(external_id)
            .map(|g| g.aggregate.release_dates)
            .unwrap_or_default()
    }

    /// Local ids linked to the given local game id as similar, in either direction.
    pub fn similar_to(&self, game_id: i64) -> Vec<i64> {
        self.lock()
            .similar
            .iter()
            .filter_map(|(a, b)| match (*a == game_id, *b == game_id) {
                (true, _) => Some(*b),
                (_, true) => Some(*a),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<StoredRun> {
        self.lock().runs.clone()
    }

    /// Seed a Game directly, bypassing the pipeline.
    pub fn seed_game(&self, aggregate: GameAggregate) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner
            .games
            .insert(aggregate.external_id, StoredGame { id, aggregate });
        id
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn find_reference(
        &self,
        kind: EntityKind,
        external_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.lock().references.get(&(kind, external_id)).map(|r| r.id))
    }

    async fn insert_reference(&self, row: &NewReference) -> Result<i64, StoreError> {
        if !row.kind.is_reference() {
            return Err(StoreError::UnsupportedKind(row.kind));
        }
        let mut inner = self.lock();
        let key = (row.kind, row.external_id);
        if inner.references.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: row.kind,
                external_id: row.external_id,
            });
        }
        let id = inner.next_id();
        inner.references.insert(
            key,
            StoredReference {
                id,
                row: row.clone(),
            },
        );
        Ok(id)
    }

    async fn find_localization(
        &self,
        external_id: i64,
    ) -> Result<Option<LocalizationDraft>, StoreError> {
        Ok(self
            .lock()
            .games
            .values()
            .flat_map(|g| g.aggregate.localizations.iter())
            .find(|l| l.external_id == external_id)
            .cloned())
    }

    async fn find_game(&self, external_id: i64) -> Result<Option<GameRow>, StoreError> {
        Ok(self.lock().games.get(&external_id).map(|g| GameRow {
            id: g.id,
            external_id,
            title: g.aggregate.title.clone(),
            last_synced: g.aggregate.last_synced,
        }))
    }

    async fn upsert_game_aggregate(&self, game: &GameAggregate) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let mut aggregate = game.clone();
        let previous = inner
            .games
            .get(&game.external_id)
            .map(|g| (g.id, g.aggregate.clone()));
        let id = match previous {
            Some((id, previous)) => {
                carry_over(&mut aggregate, &previous);
                id
            }
            None => inner.next_id(),
        };
        aggregate.unavailable.clear();
        inner
            .games
            .insert(game.external_id, StoredGame { id, aggregate });
        for other in &game.similar_game_ids {
            if *other != id {
                inner.similar.insert((id.min(*other), id.max(*other)));
            }
        }
        Ok(id)
    }

    async fn begin_run(
        &self,
        search_type: SearchType,
        started_from: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.lock().runs.push(StoredRun {
            id,
            search_type,
            started_from,
            status: RunStatus::Running,
            totals: RunTotals::default(),
            finished_at: None,
        });
        Ok(id)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        totals: &RunTotals,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        run.status = status;
        run.totals = totals.clone();
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn last_watermark(
        &self,
        search_type: SearchType,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .runs
            .iter()
            .rev()
            .filter(|r| r.search_type == search_type && r.status == RunStatus::Succeeded)
            .find_map(|r| r.totals.watermark))
    }
}

/// Apply the Postgres write rules to a whole-aggregate replace: the cover survives an empty
/// resolution, localizations are never dropped, and unavailable owned rows are kept.
fn carry_over(next: &mut GameAggregate, previous: &GameAggregate) {
    if next.cover_url.is_none() {
        next.cover_url = previous.cover_url.clone();
    }
    keep_stored(&mut next.localizations, &previous.localizations, |l| l.external_id, |_| true);

    let involvements = next.unavailable_ids(EntityKind::InvolvedCompany).to_vec();
    keep_stored(
        &mut next.involvements,
        &previous.involvements,
        |i| i.external_id,
        |id| involvements.contains(&id),
    );
    let release_dates = next.unavailable_ids(EntityKind::ReleaseDate).to_vec();
    keep_stored(
        &mut next.release_dates,
        &previous.release_dates,
        |r| r.external_id,
        |id| release_dates.contains(&id),
    );
}

fn keep_stored<T: Clone>(
    next: &mut Vec<T>,
    previous: &[T],
    external_id: impl Fn(&T) -> i64,
    keep: impl Fn(i64) -> bool,
) {
    for row in previous {
        let id = external_id(row);
        if keep(id) && !next.iter().any(|n| external_id(n) == id) {
            next.push(row.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn platform(external_id: i64) -> NewReference {
        NewReference {
            kind: EntityKind::Platform,
            external_id,
            name: Some("PC".into()),
            slug: Some("win".into()),
            source_updated_at: None,
            payload: json!({"name": "PC"}),
        }
    }

    #[tokio::test]
    async fn duplicate_reference_is_a_conflict() {
        let store = MemoryCatalogStore::new();
        let id = store.insert_reference(&platform(6)).await.unwrap();
        let err = store.insert_reference(&platform(6)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                kind: EntityKind::Platform,
                external_id: 6
            }
        ));
        assert_eq!(
            store.find_reference(EntityKind::Platform, 6).await.unwrap(),
            Some(id)
        );
        assert_eq!(store.reference_count(EntityKind::Platform), 1);
    }

    #[tokio::test]
    async fn same_external_id_in_different_kinds_is_fine() {
        let store = MemoryCatalogStore::new();
        store.insert_reference(&platform(6)).await.unwrap();
        let genre = NewReference {
            kind: EntityKind::Genre,
            ..platform(6)
        };
        store.insert_reference(&genre).await.unwrap();
        assert_eq!(store.reference_count(EntityKind::Genre), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_local_id() {
        let store = MemoryCatalogStore::new();
        let mut game = GameAggregate {
            external_id: 42,
            title: "Hades".into(),
            ..Default::default()
        };
        let first = store.upsert_game_aggregate(&game).await.unwrap();
        game.title = "Hades II".into();
        let second = store.upsert_game_aggregate(&game).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.game_count(), 1);
        assert_eq!(store.game(42).unwrap().aggregate.title, "Hades II");
    }

    #[tokio::test]
    async fn unavailable_owned_rows_outlive_a_rebuild() {
        let store = MemoryCatalogStore::new();
        let release_date = |external_id| ReleaseDateDraft {
            external_id,
            date: Utc::now(),
            platform_id: 1,
            region_id: 2,
        };
        let first = GameAggregate {
            external_id: 42,
            title: "Hades".into(),
            cover_url: Some("https://images.igdb.com/co11.jpg".into()),
            localizations: vec![LocalizationDraft {
                external_id: 400,
                name: Some("Hades (JP)".into()),
                region_id: None,
            }],
            release_dates: vec![release_date(900), release_date(901)],
            ..Default::default()
        };
        store.upsert_game_aggregate(&first).await.unwrap();

        let rebuilt = GameAggregate {
            external_id: 42,
            title: "Hades".into(),
            unavailable: BTreeMap::from([(EntityKind::ReleaseDate, vec![901])]),
            ..Default::default()
        };
        store.upsert_game_aggregate(&rebuilt).await.unwrap();

        let stored = store.game(42).unwrap().aggregate;
        assert_eq!(stored.cover_url.as_deref(), Some("https://images.igdb.com/co11.jpg"));
        assert_eq!(stored.localizations.len(), 1);
        let dates: Vec<i64> = stored.release_dates.iter().map(|r| r.external_id).collect();
        assert_eq!(dates, vec![901]);
        assert!(stored.unavailable.is_empty());
        assert_eq!(
            store.find_localization(400).await.unwrap().and_then(|l| l.name),
            Some("Hades (JP)".into())
        );
    }

    #[tokio::test]
    async fn watermark_comes_from_latest_successful_run() {
        let store = MemoryCatalogStore::new();
        let from = Utc::now();
        let ok = store.begin_run(SearchType::UpdatedAt, from).await.unwrap();
        let mark = from + chrono::Duration::hours(1);
        store
            .finish_run(
                ok,
                RunStatus::Succeeded,
                &RunTotals {
                    watermark: Some(mark),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let failed = store.begin_run(SearchType::UpdatedAt, mark).await.unwrap();
        store
            .finish_run(
                failed,
                RunStatus::Failed,
                &RunTotals {
                    watermark: Some(mark + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.last_watermark(SearchType::UpdatedAt).await.unwrap(),
            Some(mark)
        );
        assert_eq!(store.last_watermark(SearchType::CreatedAt).await.unwrap(), None);
    }
}
