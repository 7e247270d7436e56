//! Notification and broadcast trait definitions

use async_trait::async_trait;
use gpushare_core::GpushareResult;
use serde::Serialize;
use tracing::{debug, warn};

/// An outgoing notice with fully resolved recipients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mail {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl Mail {
    pub fn has_recipients(&self) -> bool {
        !(self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty())
    }
}

/// Notification gateway
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notice
    async fn send(&self, mail: &Mail) -> GpushareResult<()>;

    /// Get the gateway name
    fn name(&self) -> &'static str;
}

/// Pushes serialized device snapshots to subscribers of a topic
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, topic: &str, message: String) -> GpushareResult<()>;
}

/// Send every notice, logging failures instead of returning them
pub async fn deliver(notifier: &dyn Notifier, mails: Vec<Mail>) {
    for mail in mails {
        if !mail.has_recipients() {
            debug!(subject = %mail.subject, "Dropping notice without recipients");
            continue;
        }
        if let Err(e) = notifier.send(&mail).await {
            warn!(
                notifier = notifier.name(),
                subject = %mail.subject,
                error = %e,
                "Failed to send notice"
            );
        }
    }
}

/// Publish a message, logging failures instead of returning them
pub async fn announce(broadcaster: &dyn Broadcaster, topic: &str, message: GpushareResult<String>) {
    let result = match message {
        Ok(message) => broadcaster.publish(topic, message).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(topic = %topic, error = %e, "Failed to publish device state");
    }
}
