use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::config::SimilarGamesPolicy;
use super::error::SyncError;
use super::models::{unix_to_utc, CatalogRecord, EntityKind};
use super::resolver::EntityResolver;
use crate::database_ops::store::GameAggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The Game was (re)built and committed. `omitted` counts sub-entities left out because they
    /// could not be resolved.
    Upserted { game_id: i64, omitted: usize },
    /// Local copy is at least as new as the record; nothing was fetched or written.
    Unchanged { game_id: i64 },
}

/// Builds one Game aggregate from a catalog record and commits it.
pub struct AggregateBuilder {
    resolver: Arc<EntityResolver>,
    similar_games: SimilarGamesPolicy,
    resolve_covers: bool,
}

impl AggregateBuilder {
    pub fn new(resolver: Arc<EntityResolver>) -> Self {
        Self {
            resolver,
            similar_games: SimilarGamesPolicy::FirstMatch,
            resolve_covers: true,
        }
    }

    pub fn with_similar_games(mut self, policy: SimilarGamesPolicy) -> Self {
        self.similar_games = policy;
        self
    }

    pub fn with_covers(mut self, enabled: bool) -> Self {
        self.resolve_covers = enabled;
        self
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    /// Resolve everything `record` references and upsert the Game in one transaction.
    ///
    /// Sub-entities that fail with an entity-scoped error are logged and omitted. Auth, deadline
    /// and persistence errors are returned to the caller.
    #[instrument(level = "debug", skip(self, record), fields(external_id = record.id))]
    pub async fn build_and_upsert(&self, record: &CatalogRecord) -> Result<BuildOutcome, SyncError> {
        let store = self.resolver.store();
        let last_modified = record.last_modified();
        if let Some(existing) = store.find_game(record.id).await? {
            if let Some(synced) = existing.last_synced {
                if last_modified.map_or(true, |modified| synced >= modified) {
                    debug!(target = "igdb", external_id = record.id, "game unchanged; skipping");
                    return Ok(BuildOutcome::Unchanged {
                        game_id: existing.id,
                    });
                }
            }
        }

        let mut omitted = Omissions::default();
        let mut game = GameAggregate {
            external_id: record.id,
            title: record.title().to_string(),
            slug: record.slug.clone(),
            summary: record.summary.clone(),
            storyline: record.storyline.clone(),
            rating: record.total_rating,
            rating_count: record.total_rating_count,
            first_release_date: record
                .first_release_date
                .and_then(unix_to_utc),
            last_synced: Some(last_modified.unwrap_or_else(Utc::now)),
            associations: BTreeMap::new(),
            ..Default::default()
        };

        for (kind, ids) in record.reference_lists() {
            let resolved = self.resolve_list(record.id, kind, ids, &mut omitted).await?;
            game.associations.insert(kind, resolved);
        }
        let franchises = self
            .resolve_list(record.id, EntityKind::Franchise, &record.franchises, &mut omitted)
            .await?;
        game.associations.insert(EntityKind::Franchise, franchises);

        if self.resolve_covers {
            if let Some(cover) = record.cover {
                let url = self
                    .resolver
                    .resolve_image_url(EntityKind::Cover, cover)
                    .await;
                game.cover_url = tolerate(record.id, EntityKind::Cover, cover, url, &mut omitted)?;
            }
        }

        for id in dedup(&record.game_localizations) {
            let draft = self.resolver.resolve_localization(id).await;
            if let Some(draft) = tolerate(record.id, EntityKind::Localization, id, draft, &mut omitted)? {
                game.localizations.push(draft);
            }
        }
        for id in dedup(&record.involved_companies) {
            let draft = self.resolver.resolve_involvement(id).await;
            if let Some(draft) =
                tolerate(record.id, EntityKind::InvolvedCompany, id, draft, &mut omitted)?
            {
                game.involvements.push(draft);
            }
        }
        for id in dedup(&record.release_dates) {
            let draft = self.resolver.resolve_release_date(id).await;
            if let Some(draft) = tolerate(record.id, EntityKind::ReleaseDate, id, draft, &mut omitted)? {
                game.release_dates.push(draft);
            }
        }

        game.similar_game_ids = self.link_similar(record).await?;
        game.unavailable = omitted.ids;

        let game_id = store.upsert_game_aggregate(&game).await?;
        let omitted = omitted.count;
        debug!(
            target = "igdb",
            external_id = record.id,
            game_id,
            omitted,
            "game aggregate upserted"
        );
        Ok(BuildOutcome::Upserted { game_id, omitted })
    }

    async fn resolve_list(
        &self,
        record_id: i64,
        kind: EntityKind,
        ids: &[i64],
        omitted: &mut Omissions,
    ) -> Result<Vec<i64>, SyncError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in dedup(ids) {
            let resolved = self.resolver.resolve(kind, id).await;
            if let Some(local) = tolerate(record_id, kind, id, resolved, omitted)? {
                out.push(local);
            }
        }
        Ok(out)
    }

    /// Only similar games that already exist locally are linked; nothing is fetched.
    async fn link_similar(&self, record: &CatalogRecord) -> Result<Vec<i64>, SyncError> {
        let mut linked = Vec::new();
        for id in dedup(&record.similar_games) {
            if id == record.id {
                continue;
            }
            if let Some(local) = self.resolver.local_game(id).await? {
                linked.push(local);
                if self.similar_games == SimilarGamesPolicy::FirstMatch {
                    break;
                }
            }
        }
        Ok(linked)
    }
}

/// Sub-entities left out of one build because they could not be resolved.
#[derive(Debug, Default)]
struct Omissions {
    count: usize,
    ids: BTreeMap<EntityKind, Vec<i64>>,
}

impl Omissions {
    fn record(&mut self, kind: EntityKind, entity_id: i64) {
        self.count += 1;
        self.ids.entry(kind).or_default().push(entity_id);
    }
}

/// Entity-scoped failures become "unavailable"; everything else propagates.
fn tolerate<T>(
    record_id: i64,
    kind: EntityKind,
    entity_id: i64,
    result: Result<Option<T>, SyncError>,
    omitted: &mut Omissions,
) -> Result<Option<T>, SyncError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_entity_scoped() => {
            omitted.record(kind, entity_id);
            warn!(
                target = "igdb",
                external_id = record_id,
                kind = %kind,
                entity_id,
                error = %err,
                "sub-entity unavailable; omitted"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn dedup(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        assert_eq!(dedup(&[6, 48, 6, 130, 48]), vec![6, 48, 130]);
        assert!(dedup(&[]).is_empty());
    }

    #[test]
    fn tolerate_swallows_only_entity_scoped_errors() {
        let mut omitted = Omissions::default();
        let upstream: Result<Option<i64>, SyncError> = Err(SyncError::Upstream {
            kind: EntityKind::Genre,
            id: Some(5),
            status: 500,
        });
        assert_eq!(
            tolerate(42, EntityKind::Genre, 5, upstream, &mut omitted).unwrap(),
            None
        );
        assert_eq!(omitted.count, 1);
        assert_eq!(omitted.ids.get(&EntityKind::Genre), Some(&vec![5]));

        let auth: Result<Option<i64>, SyncError> = Err(SyncError::Auth {
            status: Some(401),
            message: "expired".into(),
        });
        assert!(tolerate(42, EntityKind::Genre, 5, auth, &mut omitted).is_err());
        assert_eq!(omitted.count, 1);
    }
}
