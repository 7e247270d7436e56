//! Notifier that writes notices to the log
//!
//! Used when no delivery backend is wired in.

use async_trait::async_trait;
use gpushare_core::GpushareResult;
use tracing::info;

use crate::traits::{Mail, Notifier};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, mail: &Mail) -> GpushareResult<()> {
        info!(
            to = ?mail.to,
            cc = ?mail.cc,
            bcc = ?mail.bcc,
            subject = %mail.subject,
            "Notice"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
