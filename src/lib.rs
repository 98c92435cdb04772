pub mod activity;
pub mod canonical;
pub mod chart;
pub mod config;
pub mod enrich;
pub mod ingest;
pub mod logging;
pub mod mapping;
pub mod output;
pub mod reports;
pub mod schema;
pub mod store;
