//! Persistent storage backends.

pub mod sqlite;

pub use sqlite::{SqliteRepository, parse_metric_date};
