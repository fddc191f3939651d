//! # LeadFlow Hub
//!
//! SQLite-backed repository, REST API server with auth and logging
//! middleware, and runtime metrics fed by the lead event bus.

pub mod api;
pub mod metrics;
pub mod middleware;
pub mod store;
