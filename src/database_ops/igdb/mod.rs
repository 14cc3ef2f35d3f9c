//! Incremental IGDB catalog sync.
//!
//! `SyncService` / `SyncDriver` page through changed games, `AggregateBuilder` turns each record
//! into a local Game aggregate, `EntityResolver` fetches and persists referenced rows on first
//! sight. Every upstream call goes through `IgdbClient`, which holds the `CredentialManager` and
//! the shared `RateGovernor`.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod governor;
pub mod models;
pub mod query;
pub mod resolver;
pub mod sync;

pub use aggregate::{AggregateBuilder, BuildOutcome};
pub use client::{CatalogApi, IgdbClient};
pub use config::{IgdbSyncConfig, SimilarGamesPolicy};
pub use credentials::CredentialManager;
pub use error::SyncError;
pub use governor::RateGovernor;
pub use models::{CatalogRecord, EntityKind, SearchType};
pub use query::{CatalogPageQuery, IgdbQuery};
pub use resolver::EntityResolver;
pub use sync::{
    default_start, DriverState, SyncDriver, SyncReport, SyncRequest, SyncService, SyncStatus,
    TriggerError,
};
