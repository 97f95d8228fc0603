use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Last full pin set returned by the cloud API, keyed by pin name.
pub type PinSnapshot = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    Idle,
    Fast,
    ActiveCheck,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Fast => "FAST",
            Self::ActiveCheck => "ACTIVE_CHECK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network failure: {cause}")]
    NetworkFailure { cause: String },
    #[error("upstream rejected request ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },
}

impl FetchError {
    pub fn network(cause: impl Into<String>) -> Self {
        Self::NetworkFailure {
            cause: cause.into(),
        }
    }

    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            status,
            body: body.into(),
        }
    }

    /// Rejections usually mean a bad token or pin name rather than a flaky link.
    pub fn is_upstream_rejected(&self) -> bool {
        matches!(self, Self::UpstreamRejected { .. })
    }
}

/// Events fanned out to dashboard subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    StatusChanged {
        online: bool,
    },
    DataUpdated {
        snapshot: PinSnapshot,
        online: bool,
        fresh: bool,
    },
    InitialState {
        snapshot: PinSnapshot,
        online: bool,
    },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "StatusChanged",
            Self::DataUpdated { .. } => "DataUpdated",
            Self::InitialState { .. } => "InitialState",
        }
    }
}

/// Read-only view of the monitor handed to anything outside the polling task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub online: bool,
    pub mode: &'static str,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: i64,
    #[serde(rename = "lastFreshAt")]
    pub last_fresh_at: Option<DateTime<Utc>>,
    #[serde(rename = "staleStreak")]
    pub stale_streak: u32,
    pub snapshot: PinSnapshot,
    #[serde(rename = "pollingActive")]
    pub polling_active: bool,
    #[serde(rename = "activeCheckUntil")]
    pub active_check_until: Option<DateTime<Utc>>,
    #[serde(rename = "cooldownUntil")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(rename = "observedAt")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            online: false,
            mode: DeviceMode::Idle.as_str(),
            last_heartbeat: -1,
            last_fresh_at: None,
            stale_streak: 0,
            snapshot: PinSnapshot::new(),
            polling_active: false,
            active_check_until: None,
            cooldown_until: None,
            observed_at: None,
        }
    }
}
