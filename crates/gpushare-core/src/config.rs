//! Configuration types for gpushare

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::model::{Device, DeviceAccess, User};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Reservation queue configuration
    pub reservations: ReservationConfig,
    /// GPU state reconciler configuration
    pub reconciler: ReconcilerConfig,
    /// Notification configuration
    pub notifications: NotificationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Provisioned devices
    pub devices: Vec<DeviceConfig>,
    /// Known users
    pub users: Vec<UserConfig>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GpushareError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpushareError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::GpushareError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), crate::GpushareError> {
        self.reservations.validate()?;

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(crate::GpushareError::Config(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        let mut usernames = std::collections::HashSet::new();
        for user in &self.users {
            if !usernames.insert(user.username.as_str()) {
                return Err(crate::GpushareError::Config(format!(
                    "Duplicate username: {}",
                    user.username
                )));
            }
        }

        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Header carrying the authenticated username, set by the fronting proxy
    pub user_header: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            user_header: "x-remote-user".to_string(),
        }
    }
}

/// Reservation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Length of a usage window in seconds
    pub usage_period_secs: u64,
    /// How long before expiry the reminder fires, in seconds
    pub reminder_period_secs: u64,
    /// Interval of the expire/remind sweep in seconds
    pub sweep_interval_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            usage_period_secs: 24 * 60 * 60,
            reminder_period_secs: 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl ReservationConfig {
    pub fn usage_period(&self) -> Duration {
        Duration::seconds(self.usage_period_secs as i64)
    }

    pub fn reminder_period(&self) -> Duration {
        Duration::seconds(self.reminder_period_secs as i64)
    }

    pub fn validate(&self) -> Result<(), crate::GpushareError> {
        if self.usage_period_secs == 0 || self.reminder_period_secs == 0 {
            return Err(crate::GpushareError::Config(
                "usage and reminder periods must be non-zero".to_string(),
            ));
        }
        if self.reminder_period_secs >= self.usage_period_secs {
            return Err(crate::GpushareError::Config(format!(
                "reminder period ({}s) must be shorter than usage period ({}s)",
                self.reminder_period_secs, self.usage_period_secs
            )));
        }
        Ok(())
    }
}

/// GPU state reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// A GPU not reconciled for longer than this is considered failed
    pub stale_after_secs: u64,
    /// Used memory above which a GPU without process info counts as busy
    pub busy_memory_threshold_mib: u64,
    /// Interval of the staleness check in seconds
    pub stale_check_interval_secs: u64,
    /// Pull-mode collection
    pub poll: PollConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30 * 60,
            busy_memory_threshold_mib: 800,
            stale_check_interval_secs: 60,
            poll: PollConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Pull-mode collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Poll collectors instead of waiting for pushed reports
    pub enabled: bool,
    /// Poll interval in seconds
    pub interval_secs: u64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Path of the collector's report endpoint
    pub path: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            timeout_secs: 5,
            path: "/gpu-info".to_string(),
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Operator addresses, copied on every failure notice
    pub operators: Vec<String>,
    /// Prefix for every subject line
    pub subject_prefix: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            operators: Vec::new(),
            subject_prefix: "[gpushare]".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A provisioned device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Collector `host:port`
    pub address: String,
    /// Principal that provisioned the device
    #[serde(default)]
    pub owner: String,
    /// Credential the collector presents when pushing reports
    #[serde(default)]
    pub api_token: Option<String>,
    /// Users allowed on this device; everyone when absent
    #[serde(default)]
    pub allowed_users: Option<Vec<String>>,
}

impl From<DeviceConfig> for Device {
    fn from(config: DeviceConfig) -> Self {
        let access = match config.allowed_users {
            Some(users) => DeviceAccess::Users(users.into_iter().collect()),
            None => DeviceAccess::Everyone,
        };
        Device {
            name: config.name,
            address: config.address,
            owner: config.owner,
            api_token: config.api_token,
            access,
        }
    }
}

/// A known user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub extra_emails: Vec<String>,
    #[serde(default)]
    pub staff: bool,
}

impl From<UserConfig> for User {
    fn from(config: UserConfig) -> Self {
        User {
            username: config.username,
            email: config.email,
            extra_emails: config.extra_emails,
            staff: config.staff,
        }
    }
}
