use chrono::{DateTime, Utc};

use super::models::SearchType;

/// Apicalypse request body builder (`fields ...; where ...; sort ...; limit ...; offset ...;`).
#[derive(Debug, Clone, Default)]
pub struct IgdbQuery {
    fields: Vec<String>,
    conditions: Vec<String>,
    sort: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl IgdbQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn filter(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn sort_asc(mut self, field: &str) -> Self {
        self.sort = Some(format!("{field} asc"));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn to_body(&self) -> String {
        let mut body = String::new();
        if self.fields.is_empty() {
            body.push_str("fields *;");
        } else {
            body.push_str(&format!("fields {};", self.fields.join(",")));
        }
        if !self.conditions.is_empty() {
            body.push_str(&format!(" where {};", self.conditions.join(" & ")));
        }
        if let Some(sort) = &self.sort {
            body.push_str(&format!(" sort {sort};"));
        }
        if let Some(limit) = self.limit {
            body.push_str(&format!(" limit {limit};"));
        }
        if let Some(offset) = self.offset {
            body.push_str(&format!(" offset {offset};"));
        }
        body
    }

    /// Fetch-by-id used by every resolver.
    pub fn by_id(id: i64) -> Self {
        Self::new().filter(format!("id = {id}")).limit(1)
    }
}

/// Fields the pipeline consumes from the `games` endpoint.
pub const CATALOG_FIELDS: &[&str] = &[
    "id",
    "name",
    "slug",
    "summary",
    "storyline",
    "total_rating",
    "total_rating_count",
    "cover",
    "first_release_date",
    "created_at",
    "updated_at",
    "platforms",
    "genres",
    "themes",
    "game_modes",
    "player_perspectives",
    "franchises",
    "age_ratings",
    "game_localizations",
    "involved_companies",
    "release_dates",
    "similar_games",
];

/// One page of changed catalog records.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPageQuery {
    pub search_type: SearchType,
    pub since: DateTime<Utc>,
    pub min_rating: f64,
    pub min_votes: i64,
    pub limit: usize,
    pub offset: usize,
}

impl CatalogPageQuery {
    pub fn to_body(&self) -> String {
        let field = self.search_type.field();
        IgdbQuery::new()
            .fields(CATALOG_FIELDS)
            .filter(format!("{field} >= {}", self.since.timestamp()))
            .filter("platforms != null")
            .filter("cover != null")
            .filter("summary != null")
            .filter("storyline != null")
            // DLC, expansions and demos carry a parent game
            .filter("parent_game = null")
            .filter(format!("total_rating > {}", format_rating(self.min_rating)))
            .filter(format!("total_rating_count > {}", self.min_votes))
            .sort_asc(field)
            .limit(self.limit)
            .offset(self.offset)
            .to_body()
    }
}

fn format_rating(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn by_id_body() {
        assert_eq!(IgdbQuery::by_id(42).to_body(), "fields *; where id = 42; limit 1;");
    }

    #[test]
    fn catalog_page_body_filters_and_paginates() {
        let q = CatalogPageQuery {
            search_type: SearchType::UpdatedAt,
            since: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            min_rating: 0.0,
            min_votes: 0,
            limit: 50,
            offset: 100,
        };
        let body = q.to_body();
        assert!(body.starts_with("fields id,name,slug,"), "{body}");
        assert!(
            body.contains(
                "where updated_at >= 1577836800 & platforms != null & cover != null \
                 & summary != null & storyline != null & parent_game = null \
                 & total_rating > 0 & total_rating_count > 0;"
            ),
            "{body}"
        );
        assert!(body.ends_with(" sort updated_at asc; limit 50; offset 100;"), "{body}");
    }

    #[test]
    fn created_at_search_sorts_by_created_at() {
        let q = CatalogPageQuery {
            search_type: SearchType::CreatedAt,
            since: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            min_rating: 70.5,
            min_votes: 10,
            limit: 10,
            offset: 0,
        };
        let body = q.to_body();
        assert!(body.contains("created_at >= 1717200000"), "{body}");
        assert!(body.contains("total_rating > 70.5 & total_rating_count > 10"), "{body}");
        assert!(body.contains("sort created_at asc;"), "{body}");
    }
}
