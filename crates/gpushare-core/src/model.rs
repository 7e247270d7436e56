//! Device, GPU, process and reservation records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A machine carrying one or more GPUs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique, human-assigned name
    pub name: String,
    /// Collector address (`host:port`)
    pub address: String,
    /// Principal that provisioned the device
    pub owner: String,
    /// Credential the collector uses when pushing reports
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Who may reserve GPUs on this device
    pub access: DeviceAccess,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            owner: String::new(),
            api_token: None,
            access: DeviceAccess::Everyone,
        }
    }

    /// Check whether a user may use this device
    pub fn can_be_used_by(&self, user: &User) -> bool {
        if user.staff {
            return true;
        }
        match &self.access {
            DeviceAccess::Everyone => true,
            DeviceAccess::Users(users) => users.contains(&user.username),
        }
    }
}

/// Device access policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAccess {
    Everyone,
    Users(BTreeSet<String>),
}

/// A person who can hold reservations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Primary address
    pub email: String,
    /// Secondary addresses
    pub extra_emails: Vec<String>,
    /// Staff may use every device
    pub staff: bool,
}

impl User {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            extra_emails: Vec::new(),
            staff: false,
        }
    }

    /// All known addresses, primary first
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses = Vec::with_capacity(1 + self.extra_emails.len());
        if !self.email.is_empty() {
            addresses.push(self.email.clone());
        }
        for email in &self.extra_emails {
            if !addresses.contains(email) {
                addresses.push(email.clone());
            }
        }
        addresses
    }
}

/// A GPU as last reconciled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gpu {
    /// Hardware-stable identity, unique across all devices
    pub uuid: String,
    /// Owning device name; never changes after creation
    pub device: String,
    pub model_name: String,
    /// Used memory as reported, e.g. "900 MiB"
    pub used_memory: String,
    /// Total memory as reported
    pub total_memory: String,
    /// Utilization as reported, e.g. "12 %"
    pub utilization: Option<String>,
    pub in_use: bool,
    pub marked_as_failed: bool,
    pub last_updated: DateTime<Utc>,
}

impl Gpu {
    /// Time since the last successful reconciliation
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_updated
    }
}

/// An OS process using a GPU at report time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub memory_usage: String,
    pub username: String,
}

/// A user's place in a GPU's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    /// GPU uuid
    pub gpu: String,
    /// Device name of the GPU
    pub device: String,
    /// Username of the requester
    pub user: String,
    /// Enqueue time
    pub time_reserved: DateTime<Utc>,
    /// Part of a device-wide next-available-spot request
    pub user_reserved_next_available_spot: bool,
    pub usage_started: Option<DateTime<Utc>>,
    pub usage_expires: Option<DateTime<Utc>>,
    pub extension_reminder_sent: bool,
}

impl Reservation {
    pub fn new(
        gpu: impl Into<String>,
        device: impl Into<String>,
        user: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            gpu: gpu.into(),
            device: device.into(),
            user: user.into(),
            time_reserved: now,
            user_reserved_next_available_spot: false,
            usage_started: None,
            usage_expires: None,
            extension_reminder_sent: false,
        }
    }

    /// Mark as part of a next-available-spot request
    pub fn next_available(mut self) -> Self {
        self.user_reserved_next_available_spot = true;
        self
    }

    /// Whether this reservation holds an active usage window
    pub fn is_current(&self) -> bool {
        self.usage_started.is_some()
    }

    /// Open a fresh usage window
    pub fn start_usage(&mut self, now: DateTime<Utc>, usage_period: Duration) {
        self.usage_started = Some(now);
        self.usage_expires = Some(now + usage_period);
        self.extension_reminder_sent = false;
    }

    /// Push the expiry out by a full usage period from now
    pub fn extend(&mut self, now: DateTime<Utc>, usage_period: Duration) {
        self.usage_expires = Some(now + usage_period);
        self.extension_reminder_sent = false;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.usage_expires, Some(expires) if now > expires)
    }

    /// Whether the reminder threshold has been reached
    pub fn reminder_due(&self, now: DateTime<Utc>, reminder_period: Duration) -> bool {
        matches!(self.usage_expires, Some(expires) if now >= expires - reminder_period)
    }
}
