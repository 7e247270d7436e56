//! Collector report ingestion and stale GPU detection

use gpushare_core::{
    Clock, CollectorReport, Gpu, GpuProcess, GpushareResult, ReconcilerConfig,
};
use gpushare_notify::{announce, deliver, Broadcaster, Mail, Notices, Notifier};
use gpushare_store::{DeviceSnapshot, EntityStore, GpuRecord};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of ingesting one report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub device: String,
    /// Entries applied to existing GPUs
    pub updated: usize,
    /// Entries that created a GPU
    pub created: usize,
    /// Entries rejected and skipped
    pub skipped: usize,
}

/// Reconciles collector telemetry into the entity store
pub struct Reconciler {
    store: Arc<EntityStore>,
    notifier: Arc<dyn Notifier>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    notices: Notices,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<EntityStore>,
        notifier: Arc<dyn Notifier>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        notices: Notices,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            broadcaster,
            clock,
            notices,
            config,
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Merge a device's report into its GPU records
    ///
    /// A bad entry is logged and skipped; the rest of the report still
    /// applies. One snapshot is published once every entry is handled.
    pub async fn ingest(
        &self,
        device: &str,
        report: &CollectorReport,
    ) -> GpushareResult<IngestSummary> {
        let handle = self.store.device(device).await?;
        if report.device_name != device {
            warn!(
                device = %device,
                reported = %report.device_name,
                "Report names a different device"
            );
        }

        let now = self.clock.now();
        let threshold = self.config.busy_memory_threshold_mib;
        let mut summary = IngestSummary {
            device: device.to_string(),
            ..Default::default()
        };

        let snapshot = {
            let mut record = handle.lock().await;

            for entry in &report.gpu_data {
                let in_use = match entry.infer_in_use(threshold) {
                    Ok(in_use) => in_use,
                    Err(e) => {
                        warn!(device = %device, gpu = %entry.uuid, error = %e, "Skipping GPU entry");
                        summary.skipped += 1;
                        continue;
                    }
                };
                if let Err(e) = self.store.claim_gpu(&entry.uuid, device).await {
                    warn!(device = %device, gpu = %entry.uuid, error = %e, "Skipping GPU entry");
                    summary.skipped += 1;
                    continue;
                }

                let processes: Vec<GpuProcess> = if in_use {
                    entry.processes.iter().map(GpuProcess::from).collect()
                } else {
                    Vec::new()
                };

                match record.gpu_mut(&entry.uuid) {
                    Some(existing) => {
                        let gpu = &mut existing.gpu;
                        gpu.model_name = entry.name.clone();
                        gpu.used_memory = entry.memory.used.clone();
                        gpu.total_memory = entry.memory.total.clone();
                        gpu.utilization = entry.gpu_util.clone();
                        gpu.in_use = in_use;
                        if gpu.marked_as_failed {
                            info!(device = %device, gpu = %entry.uuid, "GPU reporting again");
                        }
                        gpu.marked_as_failed = false;
                        gpu.last_updated = now;
                        existing.processes = processes;
                        summary.updated += 1;
                    }
                    None => {
                        info!(
                            device = %device,
                            gpu = %entry.uuid,
                            model = %entry.name,
                            "Discovered GPU"
                        );
                        let mut created = GpuRecord::new(Gpu {
                            uuid: entry.uuid.clone(),
                            device: device.to_string(),
                            model_name: entry.name.clone(),
                            used_memory: entry.memory.used.clone(),
                            total_memory: entry.memory.total.clone(),
                            utilization: entry.gpu_util.clone(),
                            in_use,
                            marked_as_failed: false,
                            last_updated: now,
                        });
                        created.processes = processes;
                        record.gpus.push(created);
                        summary.created += 1;
                    }
                }
            }

            DeviceSnapshot::capture(&record)
        };

        debug!(
            device = %device,
            updated = summary.updated,
            created = summary.created,
            skipped = summary.skipped,
            "Report ingested"
        );
        announce(self.broadcaster.as_ref(), device, snapshot.to_message()).await;
        Ok(summary)
    }

    /// Mark GPUs that stopped reporting as failed
    ///
    /// Each outage is reported once: the flag stays set until a fresh
    /// report clears it. Returns the number of GPUs newly marked.
    pub async fn detect_stale(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.config.stale_after();
        let mut marked = 0;

        for handle in self.store.devices().await {
            let (failures, snapshot) = {
                let mut record = handle.lock().await;
                let mut failures = Vec::new();

                for gpu_record in record.gpus.iter_mut() {
                    let gpu = &mut gpu_record.gpu;
                    if gpu.marked_as_failed || gpu.staleness(now) <= stale_after {
                        continue;
                    }
                    gpu.marked_as_failed = true;
                    warn!(
                        device = %gpu.device,
                        gpu = %gpu.uuid,
                        last_updated = %gpu.last_updated.to_rfc3339(),
                        "GPU stopped reporting"
                    );
                    let holder = gpu_record.queue.current().map(|r| r.user.clone());
                    failures.push((holder, gpu_record.gpu.clone()));
                }

                let snapshot =
                    (!failures.is_empty()).then(|| DeviceSnapshot::capture(&record));
                (failures, snapshot)
            };

            marked += failures.len();
            let mut mails = Vec::with_capacity(failures.len());
            for (holder, gpu) in failures {
                mails.push(self.failure_notice(holder.as_deref(), &gpu).await);
            }
            deliver(self.notifier.as_ref(), mails).await;

            if let Some(snapshot) = snapshot {
                announce(
                    self.broadcaster.as_ref(),
                    &snapshot.name,
                    snapshot.to_message(),
                )
                .await;
            }
        }

        marked
    }

    async fn failure_notice(&self, holder: Option<&str>, gpu: &Gpu) -> Mail {
        let user = match holder {
            Some(username) => self.store.user(username).await,
            None => None,
        };
        self.notices.gpu_failed(user.as_ref(), gpu)
    }
}
