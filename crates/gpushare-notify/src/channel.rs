//! Broadcaster backed by per-topic tokio broadcast channels

use async_trait::async_trait;
use gpushare_core::GpushareResult;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::traits::Broadcaster;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct ChannelBroadcaster {
    topics: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, creating it if needed
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn publish(&self, topic: &str, message: String) -> GpushareResult<()> {
        let topics = self.topics.read().await;
        match topics.get(topic) {
            Some(sender) => {
                // No live subscribers is not an error.
                let receivers = sender.send(message).unwrap_or(0);
                debug!(topic = %topic, receivers = receivers, "Published device state");
            }
            None => {
                debug!(topic = %topic, "No subscribers for topic");
            }
        }
        Ok(())
    }
}
