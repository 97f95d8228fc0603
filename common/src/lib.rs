pub mod config;
pub mod liveness;
pub mod pins;
pub mod reconnect;
pub mod types;

pub use config::{
    CloudConfig, ConfigError, MonitorConfig, OfflinePolicy, PollingStrategy, RuntimeConfig,
};
pub use liveness::{extract_heartbeat, LivenessTracker, TrackerAction};
pub use pins::*;
pub use reconnect::{CooldownError, ReconnectController, ReconnectGrant, ReconnectWindow};
pub use types::{DeviceMode, DeviceStatus, FetchError, MonitorEvent, PinSnapshot};
