pub mod api;
pub mod database_ops;
pub mod logging;

pub mod util {
    pub mod env;
}

pub use database_ops::igdb::{
    CatalogApi, IgdbClient, IgdbSyncConfig, SearchType, SyncError, SyncReport, SyncRequest,
    SyncService,
};
pub use database_ops::store::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
