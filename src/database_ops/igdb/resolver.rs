use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

use super::client::CatalogApi;
use super::error::SyncError;
use super::models::{
    strip_identity, unix_to_utc, EntityKind, IgdbCompany, IgdbImage, IgdbInvolvedCompany,
    IgdbLocalization, IgdbNamed, IgdbReleaseDate,
};
use crate::database_ops::store::{
    CatalogStore, InvolvementDraft, LocalizationDraft, NewReference, ReleaseDateDraft, StoreError,
};

/// Counters for the resolution paths taken; surfaced in the run report.
#[derive(Debug, Default)]
pub struct ResolverStats {
    pub memo_hits: AtomicU64,
    pub store_hits: AtomicU64,
    pub upstream_fetches: AtomicU64,
    pub inserted: AtomicU64,
    pub not_found: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResolverSnapshot {
    pub memo_hits: u64,
    pub store_hits: u64,
    pub upstream_fetches: u64,
    pub inserted: u64,
    pub not_found: u64,
}

/// Turns IGDB ids into local row ids, fetching and persisting on first sight.
///
/// Reference kinds and localizations are memoized per external id for the resolver's lifetime,
/// including ids the upstream reported as missing. Involvements and release dates are fetched
/// each time their Game is rebuilt.
pub struct EntityResolver {
    api: Arc<dyn CatalogApi>,
    store: Arc<dyn CatalogStore>,
    memo: Mutex<HashMap<(EntityKind, i64), Option<i64>>>,
    localizations: Mutex<HashMap<i64, Option<LocalizationDraft>>>,
    resolve_company_logos: bool,
    stats: ResolverStats,
}

impl EntityResolver {
    pub fn new(api: Arc<dyn CatalogApi>, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            api,
            store,
            memo: Mutex::new(HashMap::new()),
            localizations: Mutex::new(HashMap::new()),
            resolve_company_logos: true,
            stats: ResolverStats::default(),
        }
    }

    pub fn with_company_logos(mut self, enabled: bool) -> Self {
        self.resolve_company_logos = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        ResolverSnapshot {
            memo_hits: self.stats.memo_hits.load(Ordering::Relaxed),
            store_hits: self.stats.store_hits.load(Ordering::Relaxed),
            upstream_fetches: self.stats.upstream_fetches.load(Ordering::Relaxed),
            inserted: self.stats.inserted.load(Ordering::Relaxed),
            not_found: self.stats.not_found.load(Ordering::Relaxed),
        }
    }

    fn memo_get(&self, key: (EntityKind, i64)) -> Option<Option<i64>> {
        self.memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .copied()
    }

    fn memo_put(&self, key: (EntityKind, i64), value: Option<i64>) {
        self.memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, value);
    }

    /// Local id for a reference entity, or `None` when the upstream has no such row.
    #[instrument(level = "debug", skip(self), fields(kind = %kind))]
    pub async fn resolve(&self, kind: EntityKind, external_id: i64) -> Result<Option<i64>, SyncError> {
        if !kind.is_reference() {
            return Err(SyncError::Persistence(StoreError::UnsupportedKind(kind)));
        }
        let key = (kind, external_id);
        if let Some(hit) = self.memo_get(key) {
            self.stats.memo_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        if let Some(id) = self.store.find_reference(kind, external_id).await? {
            self.stats.store_hits.fetch_add(1, Ordering::Relaxed);
            self.memo_put(key, Some(id));
            return Ok(Some(id));
        }

        let Some(payload) = self.fetch(kind, external_id).await? else {
            debug!(target = "igdb", kind = %kind, external_id, "not found upstream");
            self.memo_put(key, None);
            return Ok(None);
        };
        let row = self.build_reference(kind, external_id, payload).await?;
        let id = self.insert_or_fetch_existing(&row).await?;
        self.memo_put(key, Some(id));
        Ok(Some(id))
    }

    async fn build_reference(
        &self,
        kind: EntityKind,
        external_id: i64,
        payload: Value,
    ) -> Result<NewReference, SyncError> {
        let named: IgdbNamed = parse(kind, external_id, &payload)?;
        let logo = if kind == EntityKind::Company && self.resolve_company_logos {
            parse::<IgdbCompany>(kind, external_id, &payload)?.logo
        } else {
            None
        };
        let mut payload = strip_identity(payload);
        if let Some(logo) = logo {
            // a missing logo never blocks the company itself
            match self.resolve_image_url(EntityKind::CompanyLogo, logo).await {
                Ok(Some(url)) => {
                    if let Value::Object(map) = &mut payload {
                        map.insert("logo_url".into(), Value::String(url));
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_entity_scoped() => {
                    info!(
                        target = "igdb",
                        company_id = external_id,
                        logo_id = logo,
                        error = %err,
                        "company logo unavailable"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(NewReference {
            kind,
            external_id,
            name: named.name,
            slug: named.slug,
            source_updated_at: named.updated_at.and_then(unix_to_utc),
            payload,
        })
    }

    /// Insert, treating a uniqueness violation as "someone already resolved it".
    async fn insert_or_fetch_existing(&self, row: &NewReference) -> Result<i64, SyncError> {
        match self.store.insert_reference(row).await {
            Ok(id) => {
                self.stats.inserted.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(StoreError::Conflict { kind, external_id }) => {
                debug!(target = "igdb", kind = %kind, external_id, "lost insert race; re-reading");
                self.store
                    .find_reference(kind, external_id)
                    .await?
                    .ok_or(SyncError::Persistence(StoreError::Conflict { kind, external_id }))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Localization draft from the memo, then the store, then the upstream.
    pub async fn resolve_localization(
        &self,
        external_id: i64,
    ) -> Result<Option<LocalizationDraft>, SyncError> {
        let memoized = self
            .localizations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&external_id)
            .cloned();
        if let Some(hit) = memoized {
            self.stats.memo_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        if let Some(stored) = self.store.find_localization(external_id).await? {
            self.stats.store_hits.fetch_add(1, Ordering::Relaxed);
            self.remember_localization(external_id, Some(stored.clone()));
            return Ok(Some(stored));
        }

        let kind = EntityKind::Localization;
        let Some(payload) = self.fetch(kind, external_id).await? else {
            self.remember_localization(external_id, None);
            return Ok(None);
        };
        let loc: IgdbLocalization = parse(kind, external_id, &payload)?;
        let region_id = match loc.region {
            Some(region) => self.resolve(EntityKind::Region, region).await?,
            None => None,
        };
        let draft = LocalizationDraft {
            external_id,
            name: loc.name,
            region_id,
        };
        self.remember_localization(external_id, Some(draft.clone()));
        Ok(Some(draft))
    }

    fn remember_localization(&self, external_id: i64, draft: Option<LocalizationDraft>) {
        self.localizations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(external_id, draft);
    }

    pub async fn resolve_involvement(
        &self,
        external_id: i64,
    ) -> Result<Option<InvolvementDraft>, SyncError> {
        let kind = EntityKind::InvolvedCompany;
        let Some(payload) = self.fetch(kind, external_id).await? else {
            return Ok(None);
        };
        let inv: IgdbInvolvedCompany = parse(kind, external_id, &payload)?;
        let Some(company) = inv.company else {
            info!(target = "igdb", involvement_id = external_id, "involvement without company; skipped");
            return Ok(None);
        };
        let Some(company_id) = self.resolve(EntityKind::Company, company).await? else {
            info!(
                target = "igdb",
                involvement_id = external_id,
                company_external_id = company,
                "company not found upstream; involvement skipped"
            );
            return Ok(None);
        };
        Ok(Some(InvolvementDraft {
            external_id,
            company_id,
            developer: inv.developer,
            publisher: inv.publisher,
            porter: inv.porting,
            supporter: inv.supporting,
        }))
    }

    /// Release dates need a date, a platform and a region; anything less is skipped.
    pub async fn resolve_release_date(
        &self,
        external_id: i64,
    ) -> Result<Option<ReleaseDateDraft>, SyncError> {
        let kind = EntityKind::ReleaseDate;
        let Some(payload) = self.fetch(kind, external_id).await? else {
            return Ok(None);
        };
        let rd: IgdbReleaseDate = parse(kind, external_id, &payload)?;
        let (Some(date), Some(platform), Some(region)) = (rd.date, rd.platform, rd.region) else {
            info!(
                target = "igdb",
                release_date_id = external_id,
                has_date = rd.date.is_some(),
                has_platform = rd.platform.is_some(),
                has_region = rd.region.is_some(),
                "incomplete release date skipped"
            );
            return Ok(None);
        };
        let Some(date) = unix_to_utc(date) else {
            info!(target = "igdb", release_date_id = external_id, date, "release date out of range; skipped");
            return Ok(None);
        };
        let platform_id = self.resolve(EntityKind::Platform, platform).await?;
        let region_id = self.resolve(EntityKind::Region, region).await?;
        match (platform_id, region_id) {
            (Some(platform_id), Some(region_id)) => Ok(Some(ReleaseDateDraft {
                external_id,
                date,
                platform_id,
                region_id,
            })),
            _ => {
                info!(
                    target = "igdb",
                    release_date_id = external_id,
                    "release date platform or region unavailable; skipped"
                );
                Ok(None)
            }
        }
    }

    /// Absolute URL of a cover or company logo.
    pub async fn resolve_image_url(
        &self,
        kind: EntityKind,
        external_id: i64,
    ) -> Result<Option<String>, SyncError> {
        let Some(payload) = self.fetch(kind, external_id).await? else {
            return Ok(None);
        };
        let image: IgdbImage = parse(kind, external_id, &payload)?;
        Ok(image.absolute_url())
    }

    /// Local id of a Game we already hold; never fetches.
    pub async fn local_game(&self, external_id: i64) -> Result<Option<i64>, SyncError> {
        Ok(self.store.find_game_id(external_id).await?)
    }

    async fn fetch(&self, kind: EntityKind, external_id: i64) -> Result<Option<Value>, SyncError> {
        self.stats.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        let found = self.api.fetch_by_id(kind, external_id).await?;
        if found.is_none() {
            self.stats.not_found.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }
}

fn parse<T: DeserializeOwned>(kind: EntityKind, id: i64, payload: &Value) -> Result<T, SyncError> {
    serde_json::from_value(payload.clone()).map_err(|source| SyncError::Parse {
        kind,
        id: Some(id),
        source,
    })
}
