pub mod db;
pub mod igdb;
pub mod store;
