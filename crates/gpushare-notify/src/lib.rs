//! gpushare-notify: Notification gateway and state broadcaster
//!
//! This crate provides the outbound edges of the system:
//! - The `Notifier` and `Broadcaster` traits
//! - Notice builders for every message the system sends
//! - A logging notifier, an in-memory notifier and a channel broadcaster

pub mod channel;
pub mod log;
pub mod memory;
pub mod notices;
pub mod traits;

pub use channel::ChannelBroadcaster;
pub use log::LogNotifier;
pub use memory::MemoryNotifier;
pub use notices::Notices;
pub use traits::{announce, deliver, Broadcaster, Mail, Notifier};
