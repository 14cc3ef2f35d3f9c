use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    CatalogStore, GameAggregate, GameRow, LocalizationDraft, NewReference, RunStatus, RunTotals,
    StoreError,
};
use crate::database_ops::db::Db;
use crate::database_ops::igdb::models::{EntityKind, SearchType};

/// Postgres-backed store; schema lives in `migrations/0001_igdb_catalog.sql`.
#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn reference_table(kind: EntityKind) -> Result<&'static str, StoreError> {
    Ok(match kind {
        EntityKind::Platform => "igdb_platforms",
        EntityKind::Genre => "igdb_genres",
        EntityKind::Theme => "igdb_themes",
        EntityKind::GameMode => "igdb_game_modes",
        EntityKind::PlayerPerspective => "igdb_player_perspectives",
        EntityKind::Franchise => "igdb_franchises",
        EntityKind::AgeRating => "igdb_age_ratings",
        EntityKind::Region => "igdb_regions",
        EntityKind::Company => "igdb_companies",
        other => return Err(StoreError::UnsupportedKind(other)),
    })
}

fn association_table(kind: EntityKind) -> Result<&'static str, StoreError> {
    Ok(match kind {
        EntityKind::Platform => "igdb_game_platforms",
        EntityKind::Genre => "igdb_game_genres",
        EntityKind::Theme => "igdb_game_themes",
        EntityKind::GameMode => "igdb_game_game_modes",
        EntityKind::PlayerPerspective => "igdb_game_player_perspectives",
        EntityKind::Franchise => "igdb_game_franchises",
        EntityKind::AgeRating => "igdb_game_age_ratings",
        other => return Err(StoreError::UnsupportedKind(other)),
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find_reference(
        &self,
        kind: EntityKind,
        external_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let table = reference_table(kind)?;
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT id FROM {table} WHERE igdb_id = $1"
        ))
        .persistent(false)
        .bind(external_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(id)
    }

    async fn insert_reference(&self, row: &NewReference) -> Result<i64, StoreError> {
        let table = reference_table(row.kind)?;
        let inserted = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {table} (igdb_id, name, slug, source_updated_at, payload) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (igdb_id) DO NOTHING \
             RETURNING id"
        ))
        .persistent(false)
        .bind(row.external_id)
        .bind(row.name.as_deref())
        .bind(row.slug.as_deref())
        .bind(row.source_updated_at)
        .bind(&row.payload)
        .fetch_optional(&self.db.pool)
        .await?;
        inserted.ok_or(StoreError::Conflict {
            kind: row.kind,
            external_id: row.external_id,
        })
    }

    async fn find_localization(
        &self,
        external_id: i64,
    ) -> Result<Option<LocalizationDraft>, StoreError> {
        let row = sqlx::query(
            "SELECT igdb_id, name, region_id FROM igdb_game_localizations WHERE igdb_id = $1",
        )
        .persistent(false)
        .bind(external_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(|r| -> Result<LocalizationDraft, StoreError> {
            Ok(LocalizationDraft {
                external_id: r.try_get("igdb_id")?,
                name: r.try_get("name")?,
                region_id: r.try_get("region_id")?,
            })
        })
        .transpose()
    }

    async fn find_game(&self, external_id: i64) -> Result<Option<GameRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, igdb_id, title, last_synced FROM igdb_games WHERE igdb_id = $1",
        )
        .persistent(false)
        .bind(external_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(|r| -> Result<GameRow, StoreError> {
            Ok(GameRow {
                id: r.try_get("id")?,
                external_id: r.try_get("igdb_id")?,
                title: r.try_get("title")?,
                last_synced: r.try_get("last_synced")?,
            })
        })
        .transpose()
    }

    #[instrument(level = "debug", skip(self, game), fields(external_id = game.external_id))]
    async fn upsert_game_aggregate(&self, game: &GameAggregate) -> Result<i64, StoreError> {
        let mut tx = self.db.pool.begin().await?;
        let game_id = upsert_game_row(&mut tx, game).await?;

        for (kind, ids) in &game.associations {
            replace_associations(&mut tx, game_id, *kind, ids).await?;
        }
        write_localizations(&mut tx, game_id, game).await?;
        write_involvements(&mut tx, game_id, game).await?;
        write_release_dates(&mut tx, game_id, game).await?;

        for other in game.similar_game_ids.iter().filter(|id| **id != game_id) {
            sqlx::query(
                "INSERT INTO igdb_similar_games (game_id, similar_game_id) \
                 VALUES ($1, $2), ($2, $1) ON CONFLICT DO NOTHING",
            )
            .persistent(false)
            .bind(game_id)
            .bind(*other)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(target = "igdb", game_id, "game aggregate committed");
        Ok(game_id)
    }

    async fn begin_run(
        &self,
        search_type: SearchType,
        started_from: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO igdb_sync_runs (id, search_type, started_from, status) \
             VALUES ($1, $2, $3, 'running')",
        )
        .persistent(false)
        .bind(id)
        .bind(search_type.field())
        .bind(started_from)
        .execute(&self.db.pool)
        .await?;
        Ok(id)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        totals: &RunTotals,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE igdb_sync_runs SET finished_at = now(), status = $2, pages = $3, \
             fetched = $4, upserted = $5, skipped_unchanged = $6, failed = $7, \
             watermark = $8, error = $9 WHERE id = $1",
        )
        .persistent(false)
        .bind(run_id)
        .bind(status.as_str())
        .bind(totals.pages as i64)
        .bind(totals.fetched as i64)
        .bind(totals.upserted as i64)
        .bind(totals.skipped_unchanged as i64)
        .bind(totals.failed as i64)
        .bind(totals.watermark)
        .bind(totals.error.as_deref())
        .execute(&self.db.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownRun(run_id));
        }
        Ok(())
    }

    async fn last_watermark(
        &self,
        search_type: SearchType,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mark = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT watermark FROM igdb_sync_runs \
             WHERE search_type = $1 AND status = 'succeeded' AND watermark IS NOT NULL \
             ORDER BY finished_at DESC LIMIT 1",
        )
        .persistent(false)
        .bind(search_type.field())
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(mark.flatten())
    }
}

async fn upsert_game_row(conn: &mut PgConnection, game: &GameAggregate) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO igdb_games \
         (igdb_id, title, slug, summary, storyline, rating, rating_count, cover_url, \
          first_release_date, last_synced) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (igdb_id) DO UPDATE SET \
           title = EXCLUDED.title, slug = EXCLUDED.slug, summary = EXCLUDED.summary, \
           storyline = EXCLUDED.storyline, rating = EXCLUDED.rating, \
           rating_count = EXCLUDED.rating_count, \
           cover_url = COALESCE(EXCLUDED.cover_url, igdb_games.cover_url), \
           first_release_date = EXCLUDED.first_release_date, \
           last_synced = EXCLUDED.last_synced, updated_at = now() \
         RETURNING id",
    )
    .persistent(false)
    .bind(game.external_id)
    .bind(&game.title)
    .bind(game.slug.as_deref())
    .bind(game.summary.as_deref())
    .bind(game.storyline.as_deref())
    .bind(game.rating)
    .bind(game.rating_count)
    .bind(game.cover_url.as_deref())
    .bind(game.first_release_date)
    .bind(game.last_synced)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn replace_associations(
    conn: &mut PgConnection,
    game_id: i64,
    kind: EntityKind,
    ids: &[i64],
) -> Result<(), StoreError> {
    let table = association_table(kind)?;
    sqlx::query(&format!("DELETE FROM {table} WHERE game_id = $1"))
        .persistent(false)
        .bind(game_id)
        .execute(&mut *conn)
        .await?;
    if ids.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (game_id, ref_id) "));
    qb.push_values(ids, |mut b, ref_id| {
        b.push_bind(game_id);
        b.push_bind(*ref_id);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb.build().persistent(false).execute(&mut *conn).await?;
    Ok(())
}

/// Drop owned rows of this game whose IGDB id is no longer referenced.
///
/// `keep` must include ids that were listed but unavailable during this build.
async fn prune_owned(
    conn: &mut PgConnection,
    table: &str,
    game_id: i64,
    keep: &[i64],
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "DELETE FROM {table} WHERE game_id = $1 AND NOT (igdb_id = ANY($2))"
    ))
    .persistent(false)
    .bind(game_id)
    .bind(keep)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Localizations are reference rows: upserted, re-pointed at this Game, never removed here.
async fn write_localizations(
    conn: &mut PgConnection,
    game_id: i64,
    game: &GameAggregate,
) -> Result<(), StoreError> {
    for loc in &game.localizations {
        sqlx::query(
            "INSERT INTO igdb_game_localizations (igdb_id, game_id, name, region_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (igdb_id) DO UPDATE SET game_id = EXCLUDED.game_id, \
               name = EXCLUDED.name, region_id = EXCLUDED.region_id",
        )
        .persistent(false)
        .bind(loc.external_id)
        .bind(game_id)
        .bind(loc.name.as_deref())
        .bind(loc.region_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_involvements(
    conn: &mut PgConnection,
    game_id: i64,
    game: &GameAggregate,
) -> Result<(), StoreError> {
    for inv in &game.involvements {
        sqlx::query(
            "INSERT INTO igdb_company_games \
             (igdb_id, game_id, company_id, developer, publisher, porter, supporter) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (igdb_id) DO UPDATE SET game_id = EXCLUDED.game_id, \
               company_id = EXCLUDED.company_id, developer = EXCLUDED.developer, \
               publisher = EXCLUDED.publisher, porter = EXCLUDED.porter, \
               supporter = EXCLUDED.supporter",
        )
        .persistent(false)
        .bind(inv.external_id)
        .bind(game_id)
        .bind(inv.company_id)
        .bind(inv.developer)
        .bind(inv.publisher)
        .bind(inv.porter)
        .bind(inv.supporter)
        .execute(&mut *conn)
        .await?;
    }
    let keep = keep_ids(
        game.involvements.iter().map(|i| i.external_id),
        game.unavailable_ids(EntityKind::InvolvedCompany),
    );
    prune_owned(conn, "igdb_company_games", game_id, &keep).await
}

async fn write_release_dates(
    conn: &mut PgConnection,
    game_id: i64,
    game: &GameAggregate,
) -> Result<(), StoreError> {
    for rd in &game.release_dates {
        sqlx::query(
            "INSERT INTO igdb_release_dates \
             (igdb_id, game_id, platform_id, region_id, release_date) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (igdb_id) DO UPDATE SET game_id = EXCLUDED.game_id, \
               platform_id = EXCLUDED.platform_id, region_id = EXCLUDED.region_id, \
               release_date = EXCLUDED.release_date",
        )
        .persistent(false)
        .bind(rd.external_id)
        .bind(game_id)
        .bind(rd.platform_id)
        .bind(rd.region_id)
        .bind(rd.date)
        .execute(&mut *conn)
        .await?;
    }
    let keep = keep_ids(
        game.release_dates.iter().map(|r| r.external_id),
        game.unavailable_ids(EntityKind::ReleaseDate),
    );
    prune_owned(conn, "igdb_release_dates", game_id, &keep).await
}

fn keep_ids(listed: impl Iterator<Item = i64>, unavailable: &[i64]) -> Vec<i64> {
    let mut keep: Vec<i64> = listed.chain(unavailable.iter().copied()).collect();
    keep.sort_unstable();
    keep.dedup();
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_reference_kind_has_a_table() {
        for kind in EntityKind::REFERENCE {
            assert!(reference_table(kind).is_ok(), "{kind}");
        }
        assert!(matches!(
            reference_table(EntityKind::Game),
            Err(StoreError::UnsupportedKind(EntityKind::Game))
        ));
    }

    #[test]
    fn unavailable_ids_survive_pruning() {
        assert_eq!(keep_ids([301, 300].into_iter(), &[302, 300]), vec![300, 301, 302]);
        assert!(keep_ids(std::iter::empty(), &[]).is_empty());
    }

    #[test]
    fn region_and_company_have_no_game_association_table() {
        assert!(association_table(EntityKind::Region).is_err());
        assert!(association_table(EntityKind::Company).is_err());
        assert_eq!(
            association_table(EntityKind::Franchise).ok(),
            Some("igdb_game_franchises")
        );
    }
}
