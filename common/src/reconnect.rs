use thiserror::Error;

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("manual reconnect is cooling down, retry in {remaining_ms} ms")]
pub struct CooldownError {
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectWindow {
    pub cooldown_until_ms: u64,
    pub active_until_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectGrant {
    pub active_until_ms: u64,
    pub cooldown_until_ms: u64,
}

/// Gatekeeper for user-triggered "check now" requests.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    cooldown_ms: u64,
    active_window_ms: u64,
    window: ReconnectWindow,
}

impl ReconnectController {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            cooldown_ms: config.cooldown_ms,
            active_window_ms: config.active_window_ms,
            window: ReconnectWindow {
                cooldown_until_ms: 0,
                active_until_ms: None,
            },
        }
    }

    pub fn window(&self) -> ReconnectWindow {
        self.window
    }

    /// Accepts a manual check unless the cooldown is still running. A rejected
    /// request leaves the window untouched.
    pub fn request_manual_check(&mut self, now_ms: u64) -> Result<ReconnectGrant, CooldownError> {
        if now_ms < self.window.cooldown_until_ms {
            return Err(CooldownError {
                remaining_ms: self.window.cooldown_until_ms - now_ms,
            });
        }

        let grant = ReconnectGrant {
            active_until_ms: now_ms.saturating_add(self.active_window_ms),
            cooldown_until_ms: now_ms.saturating_add(self.cooldown_ms),
        };
        self.window = ReconnectWindow {
            cooldown_until_ms: grant.cooldown_until_ms,
            active_until_ms: Some(grant.active_until_ms),
        };
        Ok(grant)
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.window
            .active_until_ms
            .map(|until| now_ms < until)
            .unwrap_or(false)
    }

    /// Clears an elapsed active window. Returns true when the window ended on this call.
    pub fn expire(&mut self, now_ms: u64) -> bool {
        match self.window.active_until_ms {
            Some(until) if now_ms >= until => {
                self.window.active_until_ms = None;
                true
            }
            _ => false,
        }
    }

    pub fn cooldown_remaining_ms(&self, now_ms: u64) -> u64 {
        self.window.cooldown_until_ms.saturating_sub(now_ms)
    }
}
