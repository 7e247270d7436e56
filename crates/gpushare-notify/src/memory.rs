//! Notifier that keeps every notice in memory

use async_trait::async_trait;
use gpushare_core::{GpushareError, GpushareResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::traits::{Mail, Notifier};

#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Mail>>,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notices delivered so far
    pub async fn sent(&self) -> Vec<Mail> {
        self.sent.lock().await.clone()
    }

    /// Take and clear the delivered notices
    pub async fn take(&self) -> Vec<Mail> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, mail: &Mail) -> GpushareResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GpushareError::Notification(
                "delivery disabled".to_string(),
            ));
        }
        self.sent.lock().await.push(mail.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
