//! gpushare-scheduler: Reservation queue engine
//!
//! This crate owns every change to a GPU's reservation queue:
//! - Reserving a specific GPU or the next free spot on a device
//! - Releasing, cancelling and extending reservations
//! - The periodic expire/remind sweep
//! - Messages written by users to other users

pub mod engine;

pub use engine::{NextAvailable, QueueEngine, Release, SweepReport};
