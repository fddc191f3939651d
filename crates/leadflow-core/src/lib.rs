//! # LeadFlow Core
//!
//! Domain types, the scoring engine and the weighted assignment engine for
//! LeadFlow. Storage is abstracted behind [`repository::LeadRepository`];
//! this crate ships an in-memory implementation, the hub crate a SQLite one.

#[macro_use]
mod macros;

pub mod activity;
pub mod agent;
pub mod assignment;
pub mod cache;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod lead;
pub mod manager;
pub mod repository;
pub mod scoring;
pub mod selector;
pub mod service;
pub mod workload;

pub use error::{LeadFlowError, Result};
