//! Externally visible device view
//!
//! The same snapshot is pushed to subscribers of a device topic and
//! returned by the API.

use chrono::{DateTime, Utc};
use gpushare_core::{GpuProcess, GpushareResult};
use serde::{Deserialize, Serialize};

use crate::store::{DeviceRecord, GpuRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub gpus: Vec<GpuSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub uuid: String,
    pub model_name: String,
    /// "used / total"
    pub memory: String,
    pub used_memory: String,
    pub total_memory: String,
    pub utilization: Option<String>,
    pub processes: Vec<GpuProcess>,
    pub last_update: DateTime<Utc>,
    pub failed: bool,
    pub in_use: bool,
    pub reserved: bool,
    pub current_user: Option<String>,
    pub usage_expires: Option<DateTime<Utc>>,
    /// Waiting users in queue order
    pub next_users: Vec<String>,
}

impl DeviceSnapshot {
    pub fn capture(record: &DeviceRecord) -> Self {
        Self {
            name: record.device.name.clone(),
            gpus: record.gpus.iter().map(GpuSnapshot::capture).collect(),
        }
    }

    /// Serialized form published to subscribers
    pub fn to_message(&self) -> GpushareResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl GpuSnapshot {
    pub fn capture(record: &GpuRecord) -> Self {
        let gpu = &record.gpu;
        let current = record.queue.current();
        Self {
            uuid: gpu.uuid.clone(),
            model_name: gpu.model_name.clone(),
            memory: format!("{} / {}", gpu.used_memory, gpu.total_memory),
            used_memory: gpu.used_memory.clone(),
            total_memory: gpu.total_memory.clone(),
            utilization: gpu.utilization.clone(),
            processes: record.processes.clone(),
            last_update: gpu.last_updated,
            failed: gpu.marked_as_failed,
            in_use: gpu.in_use,
            reserved: current.is_some(),
            current_user: current.map(|r| r.user.clone()),
            usage_expires: current.and_then(|r| r.usage_expires),
            next_users: record.queue.waiting().map(|r| r.user.clone()).collect(),
        }
    }
}
