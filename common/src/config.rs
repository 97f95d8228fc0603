use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pins::{DEFAULT_MONITORED_PINS, PIN_HEARTBEAT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OfflinePolicy {
    /// Offline after `threshold` consecutive stale or failed cycles.
    Streak { threshold: u32 },
    /// Offline once no fresh heartbeat has been seen for longer than `grace_ms`.
    GracePeriod {
        #[serde(rename = "graceMs")]
        grace_ms: u64,
    },
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        Self::Streak { threshold: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollingStrategy {
    #[default]
    AlwaysOn,
    SessionGated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub online_interval_ms: u64,
    pub offline_interval_ms: u64,
    pub active_check_interval_ms: u64,
    pub offline_policy: OfflinePolicy,
    pub cooldown_ms: u64,
    pub active_window_ms: u64,
    pub fetch_timeout_ms: u64,
    pub monitored_pins: Vec<String>,
    pub heartbeat_pin: String,
    pub polling_strategy: PollingStrategy,
    pub safety_critical: bool,
    pub safety_pin: Option<String>,
    pub safety_off_value: String,
    pub command_confirm_delay_ms: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            online_interval_ms: 2_000,
            offline_interval_ms: 60_000,
            active_check_interval_ms: 3_000,
            offline_policy: OfflinePolicy::default(),
            cooldown_ms: 30_000,
            active_window_ms: 30_000,
            fetch_timeout_ms: 5_000,
            monitored_pins: DEFAULT_MONITORED_PINS
                .iter()
                .map(|pin| pin.to_string())
                .collect(),
            heartbeat_pin: PIN_HEARTBEAT.to_string(),
            polling_strategy: PollingStrategy::default(),
            safety_critical: true,
            safety_pin: None,
            safety_off_value: "0".to_string(),
            command_confirm_delay_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("offline streak threshold must be at least 1")]
    ZeroThreshold,
    #[error("cooldownMs ({cooldown_ms}) must be >= activeWindowMs ({active_window_ms})")]
    CooldownShorterThanWindow {
        cooldown_ms: u64,
        active_window_ms: u64,
    },
    #[error("monitoredPins cannot be empty")]
    NoMonitoredPins,
    #[error("monitoredPins contains duplicate pin {0}")]
    DuplicatePin(String),
    #[error("heartbeatPin {0} is not in monitoredPins")]
    HeartbeatNotMonitored(String),
    #[error("safetyPin cannot be empty")]
    EmptySafetyPin,
    #[error("cloud auth token is missing")]
    MissingToken,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("onlineIntervalMs", self.online_interval_ms),
            ("offlineIntervalMs", self.offline_interval_ms),
            ("activeCheckIntervalMs", self.active_check_interval_ms),
            ("fetchTimeoutMs", self.fetch_timeout_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration(*name));
        }

        match self.offline_policy {
            OfflinePolicy::Streak { threshold: 0 } => return Err(ConfigError::ZeroThreshold),
            OfflinePolicy::GracePeriod { grace_ms: 0 } => {
                return Err(ConfigError::ZeroDuration("graceMs"))
            }
            _ => {}
        }

        // At most one active window per cooldown.
        if self.cooldown_ms < self.active_window_ms {
            return Err(ConfigError::CooldownShorterThanWindow {
                cooldown_ms: self.cooldown_ms,
                active_window_ms: self.active_window_ms,
            });
        }

        if self.monitored_pins.is_empty() {
            return Err(ConfigError::NoMonitoredPins);
        }
        let mut seen = BTreeSet::new();
        for pin in &self.monitored_pins {
            if !seen.insert(pin.as_str()) {
                return Err(ConfigError::DuplicatePin(pin.clone()));
            }
        }
        if !seen.contains(self.heartbeat_pin.as_str()) {
            return Err(ConfigError::HeartbeatNotMonitored(
                self.heartbeat_pin.clone(),
            ));
        }

        if matches!(&self.safety_pin, Some(pin) if pin.trim().is_empty()) {
            return Err(ConfigError::EmptySafetyPin);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub base_url: String,
    pub auth_token: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://blynk.cloud/external/api".to_string(),
            auth_token: String::new(),
        }
    }
}

impl CloudConfig {
    pub fn sanitize(&mut self) {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.auth_token = self.auth_token.trim().to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}
