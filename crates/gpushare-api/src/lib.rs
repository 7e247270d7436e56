//! gpushare-api: REST API server for gpushare
//!
//! This crate provides the REST API for interacting with gpushare:
//! - Device and GPU status, with a live event stream per device
//! - Reserve, release, cancel and extend
//! - Collector report push ingestion

pub mod rest;

pub use rest::{create_router, AppState};
