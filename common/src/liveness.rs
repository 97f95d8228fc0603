use crate::{
    config::{MonitorConfig, OfflinePolicy},
    types::{DeviceMode, FetchError, MonitorEvent, PinSnapshot},
};

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    Publish(MonitorEvent),
    SafetyShutdown,
}

/// Owns the online/offline belief for the remote device.
///
/// The tracker never performs I/O: every observation returns the actions the
/// caller must carry out, in order, once the new state is fully applied.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    policy: OfflinePolicy,
    heartbeat_pin: String,
    safety_critical: bool,

    online: bool,
    last_heartbeat: i64,
    last_fresh_ms: u64,
    stale_streak: u32,
    cached_snapshot: PinSnapshot,
    mode: DeviceMode,

    // Grace-period judgements never look further back than this.
    rearmed_at_ms: u64,
}

impl LivenessTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            policy: config.offline_policy,
            heartbeat_pin: config.heartbeat_pin.clone(),
            safety_critical: config.safety_critical,
            online: false,
            last_heartbeat: -1,
            last_fresh_ms: 0,
            stale_streak: 0,
            cached_snapshot: PinSnapshot::new(),
            mode: DeviceMode::Idle,
            rearmed_at_ms: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat
    }

    /// `None` until a fresh heartbeat has been observed.
    pub fn last_fresh_ms(&self) -> Option<u64> {
        (self.last_heartbeat >= 0).then_some(self.last_fresh_ms)
    }

    pub fn stale_streak(&self) -> u32 {
        self.stale_streak
    }

    pub fn snapshot(&self) -> &PinSnapshot {
        &self.cached_snapshot
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DeviceMode) -> bool {
        if self.mode != mode {
            self.mode = mode;
            true
        } else {
            false
        }
    }

    /// Applies the outcome of one polling cycle.
    pub fn observe(
        &mut self,
        result: Result<PinSnapshot, FetchError>,
        now_ms: u64,
    ) -> Vec<TrackerAction> {
        let mut actions = Vec::new();

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(_) => {
                self.stale_streak = self.stale_streak.saturating_add(1);
                self.mark_offline_if_stale(now_ms, &mut actions);
                return actions;
            }
        };

        let heartbeat = extract_heartbeat(&snapshot, &self.heartbeat_pin);
        let fresh = heartbeat > 0 && heartbeat != self.last_heartbeat;
        let data_changed = snapshot != self.cached_snapshot;
        self.cached_snapshot = snapshot;

        if fresh {
            self.last_heartbeat = heartbeat;
            self.last_fresh_ms = now_ms;
            self.stale_streak = 0;
            if !self.online {
                self.online = true;
                actions.push(TrackerAction::Publish(MonitorEvent::StatusChanged {
                    online: true,
                }));
            }
        } else {
            self.stale_streak = self.stale_streak.saturating_add(1);
            self.mark_offline_if_stale(now_ms, &mut actions);
        }

        if fresh || data_changed {
            actions.push(TrackerAction::Publish(MonitorEvent::DataUpdated {
                snapshot: self.cached_snapshot.clone(),
                online: self.online,
                fresh,
            }));
        }

        actions
    }

    /// Whether the configured offline policy currently judges the device unreachable,
    /// regardless of the current belief.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        match self.policy {
            OfflinePolicy::Streak { threshold } => self.stale_streak >= threshold,
            OfflinePolicy::GracePeriod { grace_ms } => {
                let since = self.last_fresh_ms.max(self.rearmed_at_ms);
                now_ms.saturating_sub(since) > grace_ms
            }
        }
    }

    /// Starts staleness accounting over, used when a new polling session begins.
    pub fn rearm(&mut self, now_ms: u64) {
        self.stale_streak = 0;
        self.rearmed_at_ms = now_ms;
    }

    fn mark_offline_if_stale(&mut self, now_ms: u64, actions: &mut Vec<TrackerAction>) {
        if !self.online || !self.is_stale(now_ms) {
            return;
        }

        self.online = false;
        actions.push(TrackerAction::Publish(MonitorEvent::StatusChanged {
            online: false,
        }));
        if self.safety_critical {
            actions.push(TrackerAction::SafetyShutdown);
        }
    }
}

/// Reads the heartbeat counter out of a snapshot; anything unusable reads as 0.
pub fn extract_heartbeat(snapshot: &PinSnapshot, pin: &str) -> i64 {
    match snapshot.get(pin) {
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .unwrap_or(0),
        Some(serde_json::Value::String(text)) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| {
                    text.parse::<f64>()
                        .ok()
                        .filter(|value| value.is_finite())
                        .map(|value| value as i64)
                })
                .unwrap_or(0)
        }
        _ => 0,
    }
}
