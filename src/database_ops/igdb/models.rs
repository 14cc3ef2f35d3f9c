use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Every upstream endpoint the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Game,
    Platform,
    Genre,
    Theme,
    GameMode,
    PlayerPerspective,
    Franchise,
    AgeRating,
    Region,
    Localization,
    Company,
    InvolvedCompany,
    ReleaseDate,
    Cover,
    CompanyLogo,
}

impl EntityKind {
    pub const ALL: [EntityKind; 15] = [
        EntityKind::Game,
        EntityKind::Platform,
        EntityKind::Genre,
        EntityKind::Theme,
        EntityKind::GameMode,
        EntityKind::PlayerPerspective,
        EntityKind::Franchise,
        EntityKind::AgeRating,
        EntityKind::Region,
        EntityKind::Localization,
        EntityKind::Company,
        EntityKind::InvolvedCompany,
        EntityKind::ReleaseDate,
        EntityKind::Cover,
        EntityKind::CompanyLogo,
    ];

    /// Kinds stored as standalone reference rows keyed by their IGDB id.
    pub const REFERENCE: [EntityKind; 9] = [
        EntityKind::Platform,
        EntityKind::Genre,
        EntityKind::Theme,
        EntityKind::GameMode,
        EntityKind::PlayerPerspective,
        EntityKind::Franchise,
        EntityKind::AgeRating,
        EntityKind::Region,
        EntityKind::Company,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Game => "game",
            EntityKind::Platform => "platform",
            EntityKind::Genre => "genre",
            EntityKind::Theme => "theme",
            EntityKind::GameMode => "game_mode",
            EntityKind::PlayerPerspective => "player_perspective",
            EntityKind::Franchise => "franchise",
            EntityKind::AgeRating => "age_rating",
            EntityKind::Region => "region",
            EntityKind::Localization => "localization",
            EntityKind::Company => "company",
            EntityKind::InvolvedCompany => "involved_company",
            EntityKind::ReleaseDate => "release_date",
            EntityKind::Cover => "cover",
            EntityKind::CompanyLogo => "company_logo",
        }
    }

    /// Path under the IGDB base url, overridable through `IGDB_ENDPOINT_<LABEL>`.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            EntityKind::Game => "games",
            EntityKind::Platform => "platforms",
            EntityKind::Genre => "genres",
            EntityKind::Theme => "themes",
            EntityKind::GameMode => "game_modes",
            EntityKind::PlayerPerspective => "player_perspectives",
            EntityKind::Franchise => "franchises",
            EntityKind::AgeRating => "age_ratings",
            EntityKind::Region => "regions",
            EntityKind::Localization => "game_localizations",
            EntityKind::Company => "companies",
            EntityKind::InvolvedCompany => "involved_companies",
            EntityKind::ReleaseDate => "release_dates",
            EntityKind::Cover => "covers",
            EntityKind::CompanyLogo => "company_logos",
        }
    }

    pub fn is_reference(self) -> bool {
        Self::REFERENCE.contains(&self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which timestamp the catalog page is filtered and sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    UpdatedAt,
    CreatedAt,
}

impl SearchType {
    pub fn field(self) -> &'static str {
        match self {
            SearchType::UpdatedAt => "updated_at",
            SearchType::CreatedAt => "created_at",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

impl std::str::FromStr for SearchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "updated_at" | "updated" => Ok(SearchType::UpdatedAt),
            "created_at" | "created" => Ok(SearchType::CreatedAt),
            other => Err(format!(
                "unknown search type '{other}' (expected updated_at or created_at)"
            )),
        }
    }
}

/// One row of the `games` endpoint. Ephemeral: produced per page and consumed immediately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub storyline: Option<String>,
    #[serde(default)]
    pub total_rating: Option<f64>,
    #[serde(default)]
    pub total_rating_count: Option<i64>,
    #[serde(default)]
    pub cover: Option<i64>,
    #[serde(default)]
    pub first_release_date: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub platforms: Vec<i64>,
    #[serde(default)]
    pub genres: Vec<i64>,
    #[serde(default)]
    pub themes: Vec<i64>,
    #[serde(default)]
    pub game_modes: Vec<i64>,
    #[serde(default)]
    pub player_perspectives: Vec<i64>,
    #[serde(default)]
    pub franchises: Vec<i64>,
    #[serde(default)]
    pub age_ratings: Vec<i64>,
    #[serde(default)]
    pub game_localizations: Vec<i64>,
    #[serde(default)]
    pub involved_companies: Vec<i64>,
    #[serde(default)]
    pub release_dates: Vec<i64>,
    #[serde(default)]
    pub similar_games: Vec<i64>,
}

impl CatalogRecord {
    /// Last-modified instant; falls back to `created_at` for records never updated.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at).and_then(unix_to_utc)
    }

    pub fn timestamp_for(&self, search_type: SearchType) -> Option<DateTime<Utc>> {
        match search_type {
            SearchType::UpdatedAt => self.updated_at.and_then(unix_to_utc),
            SearchType::CreatedAt => self.created_at.and_then(unix_to_utc),
        }
    }

    /// Parse one raw page row.
    pub fn from_row(row: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(row)
    }

    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or("Untitled IGDB Game")
    }

    /// The flat reference lists, in the order the builder resolves them.
    pub fn reference_lists(&self) -> [(EntityKind, &[i64]); 6] {
        [
            (EntityKind::Platform, self.platforms.as_slice()),
            (EntityKind::Genre, self.genres.as_slice()),
            (EntityKind::Theme, self.themes.as_slice()),
            (EntityKind::GameMode, self.game_modes.as_slice()),
            (EntityKind::PlayerPerspective, self.player_perspectives.as_slice()),
            (EntityKind::AgeRating, self.age_ratings.as_slice()),
        ]
    }
}

/// Shared shape of the simple reference endpoints (platforms, genres, regions, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct IgdbNamed {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IgdbLocalization {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<i64>,
    #[serde(default)]
    pub game: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IgdbInvolvedCompany {
    pub id: i64,
    #[serde(default)]
    pub company: Option<i64>,
    #[serde(default)]
    pub developer: bool,
    #[serde(default)]
    pub publisher: bool,
    #[serde(default)]
    pub porting: bool,
    #[serde(default)]
    pub supporting: bool,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IgdbCompany {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IgdbReleaseDate {
    pub id: i64,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub platform: Option<i64>,
    #[serde(default)]
    pub region: Option<i64>,
}

/// Covers and company logos share the image shape.
#[derive(Debug, Clone, Deserialize)]
pub struct IgdbImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
}

impl IgdbImage {
    /// IGDB hands out protocol-relative thumbnails; normalize to https.
    pub fn absolute_url(&self) -> Option<String> {
        let raw = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        if raw.starts_with("//") {
            Some(format!("https:{raw}"))
        } else {
            Some(raw.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TwitchTokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[allow(dead_code)]
    #[serde(default)]
    pub token_type: String,
}

pub fn unix_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Accepts RFC 3339, `YYYY-MM-DD` (midnight UTC) or unix seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    if let Ok(secs) = raw.parse::<i64>() {
        if let Some(dt) = unix_to_utc(secs) {
            return Ok(dt);
        }
    }
    Err(format!(
        "invalid timestamp '{raw}' (expected RFC 3339, YYYY-MM-DD or unix seconds)"
    ))
}

/// Drop the upstream identity before persisting: the row gets its own surrogate id and the
/// IGDB id is stamped into the dedicated external id column instead.
pub fn strip_identity(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.remove("id");
    }
    payload
}
