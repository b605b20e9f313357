//! Infrastructure layer: job queue, scan coordination, PostgreSQL stores, config.

pub mod config;
pub mod db;
pub mod jobs;
pub mod scan;
pub mod schema;

pub use config::SchedulerConfig;
