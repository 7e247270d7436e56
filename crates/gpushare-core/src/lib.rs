//! gpushare-core: Core types for the gpushare reservation system
//!
//! This crate provides the fundamental types used throughout gpushare:
//! - Device, GPU, process and reservation records
//! - The collector telemetry report format and busy-state inference
//! - Configuration types
//! - Error handling
//! - An injectable clock

pub mod clock;
pub mod config;
pub mod error;
pub mod gpu;
pub mod model;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use gpu::*;
pub use model::*;
