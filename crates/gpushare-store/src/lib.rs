//! gpushare-store: Entity store
//!
//! This crate holds the durable state shared by the queue engine and the
//! reconciler:
//! - Devices, GPUs and process sets behind per-device locks
//! - Explicit per-GPU reservation queues
//! - The device snapshot served to subscribers and API clients

pub mod queue;
pub mod snapshot;
pub mod store;

pub use queue::ReservationQueue;
pub use snapshot::{DeviceSnapshot, GpuSnapshot};
pub use store::{DeviceHandle, DeviceRecord, EntityStore, GpuRecord};
