//! Collector telemetry report format and busy-state inference
//!
//! Collectors read hardware telemetry on each device and either expose it
//! for polling or push it to the server. Both paths deliver the same JSON:
//!
//! ```json
//! { "device_name": "box", "gpu_data": [ { "uuid": "GPU-...", "name": "...",
//!   "memory": { "used": "900 MiB", "total": "11178 MiB" }, "in_use": "na",
//!   "gpu_util": "0 %", "processes": [] } ] }
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use crate::model::GpuProcess;
use crate::{GpushareError, GpushareResult};

/// A full report from one device's collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorReport {
    pub device_name: String,
    #[serde(default)]
    pub gpu_data: Vec<GpuReport>,
}

/// Telemetry for a single GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuReport {
    pub uuid: String,
    /// Product name
    pub name: String,
    pub memory: MemoryReport,
    #[serde(default)]
    pub in_use: BusyState,
    #[serde(default)]
    pub gpu_util: Option<String>,
    #[serde(default)]
    pub processes: Vec<ProcessReport>,
}

/// Memory figures as printed by the collector, e.g. "900 MiB"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryReport {
    pub used: String,
    pub total: String,
    #[serde(default)]
    pub free: Option<String>,
}

/// Busy flag as reported by the collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyState {
    Yes,
    No,
    /// The platform cannot report per-process usage
    #[default]
    Na,
}

/// One process entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub name: String,
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub used_memory: String,
    /// Null when the collector cannot resolve the process owner
    #[serde(default = "unknown", deserialize_with = "unknown_if_null")]
    pub username: String,
}

fn unknown() -> String {
    "Unknown".to_string()
}

fn unknown_if_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(unknown))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PidRepr {
    Number(u32),
    Text(String),
}

// Collectors send pids as strings.
fn deserialize_pid<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<PidRepr>::deserialize(deserializer)? {
        Some(PidRepr::Number(pid)) => Ok(pid),
        Some(PidRepr::Text(text)) => text.trim().parse().map_err(serde::de::Error::custom),
        None => Ok(0),
    }
}

impl From<&ProcessReport> for GpuProcess {
    fn from(report: &ProcessReport) -> Self {
        GpuProcess {
            pid: report.pid,
            name: report.name.clone(),
            memory_usage: report.used_memory.clone(),
            username: report.username.clone(),
        }
    }
}

/// Parse the leading integer of a memory figure such as "900 MiB"
pub fn parse_mebibytes(value: &str) -> Option<u64> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

impl GpuReport {
    /// Decide whether the GPU is busy
    ///
    /// An explicit yes/no always wins. Without one, the GPU counts as busy
    /// when its used memory exceeds `threshold_mib`.
    pub fn infer_in_use(&self, threshold_mib: u64) -> GpushareResult<bool> {
        match self.in_use {
            BusyState::Yes => Ok(true),
            BusyState::No => Ok(false),
            BusyState::Na => parse_mebibytes(&self.memory.used)
                .map(|used| used > threshold_mib)
                .ok_or_else(|| {
                    GpushareError::Ingestion(format!(
                        "GPU {}: unparseable used memory '{}'",
                        self.uuid, self.memory.used
                    ))
                }),
        }
    }
}
