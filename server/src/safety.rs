use std::sync::Arc;

use async_trait::async_trait;
use pinwatch_common::{DeviceStatus, MonitorConfig};
use tracing::{error, info, warn};

use crate::telemetry::TelemetrySource;

/// Invoked once per ONLINE -> OFFLINE transition of a safety-critical device.
#[async_trait]
pub trait SafetyHook: Send + Sync {
    async fn on_offline(&self, status: &DeviceStatus);
}

pub struct LogOnlyHook;

#[async_trait]
impl SafetyHook for LogOnlyHook {
    async fn on_offline(&self, status: &DeviceStatus) {
        warn!(
            last_heartbeat = status.last_heartbeat,
            stale_streak = status.stale_streak,
            "device went offline; no safety pin configured"
        );
    }
}

/// Parks the relay pin in its safe value so the device reads it on reconnect.
pub struct RelayCutoffHook {
    source: Arc<dyn TelemetrySource>,
    pin: String,
    off_value: String,
}

impl RelayCutoffHook {
    pub fn new(source: Arc<dyn TelemetrySource>, pin: String, off_value: String) -> Self {
        Self {
            source,
            pin,
            off_value,
        }
    }
}

#[async_trait]
impl SafetyHook for RelayCutoffHook {
    async fn on_offline(&self, status: &DeviceStatus) {
        info!(
            pin = %self.pin,
            value = %self.off_value,
            last_heartbeat = status.last_heartbeat,
            "device went offline, cutting relay"
        );
        if let Err(err) = self.source.update_value(&self.pin, &self.off_value).await {
            error!(pin = %self.pin, "relay cutoff write failed: {err}");
        }
    }
}

pub fn build_safety_hook(
    config: &MonitorConfig,
    source: Arc<dyn TelemetrySource>,
) -> Arc<dyn SafetyHook> {
    match &config.safety_pin {
        Some(pin) => Arc::new(RelayCutoffHook::new(
            source,
            pin.clone(),
            config.safety_off_value.clone(),
        )),
        None => Arc::new(LogOnlyHook),
    }
}
