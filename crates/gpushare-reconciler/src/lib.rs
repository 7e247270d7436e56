//! gpushare-reconciler: GPU state reconciliation
//!
//! This crate keeps GPU records in line with what the collectors report:
//! - Report ingestion with busy-state inference and process replacement
//! - Stale device detection with one-shot failure notices
//! - A pull client for collectors that expose their reports over HTTP

pub mod collector;
pub mod reconciler;

pub use collector::CollectorClient;
pub use reconciler::{IngestSummary, Reconciler};
