//! Pull-mode client for collector agents

use futures::future::join_all;
use gpushare_core::{CollectorReport, Device, GpushareError, GpushareResult, PollConfig};
use std::time::Duration;
use tracing::{debug, warn};

use crate::reconciler::{IngestSummary, Reconciler};

/// Fetches reports from collectors that serve them over HTTP
pub struct CollectorClient {
    client: reqwest::Client,
    path: String,
    timeout: Duration,
}

impl CollectorClient {
    pub fn new(config: &PollConfig) -> GpushareResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GpushareError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            path: config.path.clone(),
            timeout,
        })
    }

    /// Report URL for a device
    pub fn url(&self, device: &Device) -> String {
        let base = device.address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}{}", base, self.path)
        } else {
            format!("http://{}{}", base, self.path)
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch one device's current report
    pub async fn fetch(&self, device: &Device) -> GpushareResult<CollectorReport> {
        let url = self.url(device);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GpushareError::Ingestion(format!("{} unreachable: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(GpushareError::Ingestion(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let report = response
            .json::<CollectorReport>()
            .await
            .map_err(|e| GpushareError::Ingestion(format!("{} sent a malformed report: {}", url, e)))?;
        debug!(device = %device.name, gpus = report.gpu_data.len(), "Fetched report");
        Ok(report)
    }

    async fn fetch_and_ingest(
        &self,
        reconciler: &Reconciler,
        device: &Device,
    ) -> GpushareResult<IngestSummary> {
        let report = self.fetch(device).await?;
        reconciler.ingest(&device.name, &report).await
    }

    /// Poll every device concurrently
    ///
    /// A failing device is logged and reported in the result; it never
    /// stops the others.
    pub async fn poll_all(
        &self,
        reconciler: &Reconciler,
    ) -> Vec<(String, GpushareResult<IngestSummary>)> {
        let mut devices = Vec::new();
        for handle in reconciler.store().devices().await {
            devices.push(handle.lock().await.device.clone());
        }

        let results = join_all(
            devices
                .iter()
                .map(|device| self.fetch_and_ingest(reconciler, device)),
        )
        .await;

        devices
            .into_iter()
            .zip(results)
            .map(|(device, result)| {
                if let Err(e) = &result {
                    warn!(device = %device.name, error = %e, "Collector poll failed");
                }
                (device.name, result)
            })
            .collect()
    }
}
