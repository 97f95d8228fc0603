use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use pinwatch_common::{
    CooldownError, DeviceMode, DeviceStatus, FetchError, LivenessTracker, MonitorConfig,
    MonitorEvent, PollingStrategy, ReconnectController, ReconnectGrant, TrackerAction,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{notifier::Notifier, safety::SafetyHook, telemetry::TelemetrySource};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Cooldown(#[from] CooldownError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("polling scheduler is not running")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinWriteOutcome {
    pub pin: String,
    pub value: String,
    /// `None` when read-after-write confirmation is disabled.
    pub confirmed: Option<bool>,
}

enum Command {
    ManualCheck(oneshot::Sender<Result<ReconnectGrant, CooldownError>>),
    WritePin {
        pin: String,
        value: String,
        reply: oneshot::Sender<Result<PinWriteOutcome, FetchError>>,
    },
    StartSession(oneshot::Sender<bool>),
    StopSession(oneshot::Sender<bool>),
}

enum AfterCommand {
    Continue,
    PollNow,
    Reschedule,
}

/// Cloneable entry point for everything outside the polling task. Requests are
/// queued and applied between cycles, never during one.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub async fn request_manual_check(&self) -> Result<ReconnectGrant, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ManualCheck(reply)).await?;
        let result = response.await.map_err(|_| CommandError::Stopped)?;
        result.map_err(CommandError::from)
    }

    pub async fn write_pin(
        &self,
        pin: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<PinWriteOutcome, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::WritePin {
            pin: pin.into(),
            value: value.into(),
            reply,
        })
        .await?;
        let result = response.await.map_err(|_| CommandError::Stopped)?;
        result.map_err(CommandError::from)
    }

    pub async fn start_session(&self) -> Result<bool, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::StartSession(reply)).await?;
        response.await.map_err(|_| CommandError::Stopped)
    }

    pub async fn stop_session(&self) -> Result<bool, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::StopSession(reply)).await?;
        response.await.map_err(|_| CommandError::Stopped)
    }

    async fn send(&self, command: Command) -> Result<(), CommandError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CommandError::Stopped)
    }
}

/// The only mutator of device state: runs one cycle at a time, then picks the
/// next delay from the current cadence tier.
pub struct PollingScheduler {
    config: MonitorConfig,
    source: Arc<dyn TelemetrySource>,
    safety: Arc<dyn SafetyHook>,
    notifier: Notifier,
    tracker: LivenessTracker,
    reconnect: ReconnectController,
    session_active: bool,
    started: Instant,
    last_cycle_ms: Option<u64>,
}

impl PollingScheduler {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn TelemetrySource>,
        safety: Arc<dyn SafetyHook>,
        notifier: Notifier,
    ) -> Self {
        Self {
            tracker: LivenessTracker::new(&config),
            reconnect: ReconnectController::new(&config),
            config,
            source,
            safety,
            notifier,
            session_active: false,
            started: Instant::now(),
            last_cycle_ms: None,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (SchedulerHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(receiver, shutdown));
        (SchedulerHandle { commands }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            strategy = ?self.config.polling_strategy,
            policy = ?self.config.offline_policy,
            "polling scheduler started"
        );

        let now_ms = self.now_ms();
        self.sync_status(now_ms);
        let mut next_cycle = self.polling_enabled(now_ms).then(Instant::now);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = next_cycle.unwrap_or_else(Instant::now);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match self.handle_command(command, &mut shutdown).await {
                        AfterCommand::Continue => {}
                        AfterCommand::PollNow => next_cycle = Some(Instant::now()),
                        AfterCommand::Reschedule => next_cycle = self.schedule_next(),
                    }
                }
                _ = tokio::time::sleep_until(deadline), if next_cycle.is_some() => {
                    self.run_cycle().await;
                    next_cycle = self.schedule_next();
                }
            }
        }

        info!("polling scheduler stopped");
    }

    pub fn next_delay(&self) -> Duration {
        let ms = match self.tracker.mode() {
            DeviceMode::ActiveCheck => self.config.active_check_interval_ms,
            DeviceMode::Fast => self.config.online_interval_ms,
            DeviceMode::Idle => self.config.offline_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Runs one fetch-and-observe cycle. Returns whether the fetch succeeded.
    async fn run_cycle(&mut self) -> bool {
        let source = Arc::clone(&self.source);
        let result = isolated(async move { source.fetch_snapshot().await }).await;
        let now_ms = self.now_ms();
        self.last_cycle_ms = Some(now_ms);

        match &result {
            Ok(_) => {}
            Err(err) if err.is_upstream_rejected() => error!("cloud api rejected poll: {err}"),
            Err(err) => warn!("poll failed: {err}"),
        }

        let fetched = result.is_ok();
        let actions = self.tracker.observe(result, now_ms);
        self.apply(actions, now_ms).await;
        fetched
    }

    async fn apply(&mut self, actions: Vec<TrackerAction>, now_ms: u64) {
        let mut events = Vec::new();
        let mut safety_shutdown = false;
        for action in actions {
            match action {
                TrackerAction::Publish(event) => events.push(event),
                TrackerAction::SafetyShutdown => safety_shutdown = true,
            }
        }

        for event in &events {
            if let MonitorEvent::StatusChanged { online } = event {
                info!(
                    online = *online,
                    heartbeat = self.tracker.last_heartbeat(),
                    stale_streak = self.tracker.stale_streak(),
                    "device status changed"
                );
            }
        }

        let status = self.sync_status(now_ms);
        for event in events {
            self.notifier.publish(event);
        }

        if safety_shutdown {
            let safety = Arc::clone(&self.safety);
            let offline = status.clone();
            // A panicking hook must not take the polling loop with it.
            if let Err(err) = tokio::spawn(async move { safety.on_offline(&offline).await }).await {
                error!("safety hook failed: {err}");
            }
        }

        debug!(
            online = status.online,
            heartbeat = status.last_heartbeat,
            stale_streak = status.stale_streak,
            mode = status.mode,
            "poll cycle complete"
        );
    }

    fn schedule_next(&mut self) -> Option<Instant> {
        let now_ms = self.now_ms();
        self.sync_status(now_ms);
        if !self.polling_enabled(now_ms) {
            debug!("polling paused until a session starts");
            return None;
        }

        let delay = self.next_delay();
        debug!(
            mode = self.tracker.mode().as_str(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "next poll scheduled"
        );
        Some(Instant::now() + delay)
    }

    async fn handle_command(
        &mut self,
        command: Command,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AfterCommand {
        let now_ms = self.now_ms();
        match command {
            Command::ManualCheck(reply) => {
                let result = self.reconnect.request_manual_check(now_ms);
                let after = match &result {
                    Ok(grant) => {
                        info!(
                            active_until_ms = grant.active_until_ms,
                            cooldown_until_ms = grant.cooldown_until_ms,
                            "manual reconnect accepted"
                        );
                        self.sync_status(now_ms);
                        AfterCommand::PollNow
                    }
                    Err(err) => {
                        debug!(remaining_ms = err.remaining_ms, "manual reconnect rejected");
                        AfterCommand::Continue
                    }
                };
                let _ = reply.send(result);
                after
            }
            Command::WritePin { pin, value, reply } => {
                let (result, polled) = self.write_pin(pin, value, shutdown).await;
                let _ = reply.send(result);
                if polled {
                    AfterCommand::Reschedule
                } else {
                    AfterCommand::Continue
                }
            }
            Command::StartSession(reply) => {
                let started = self.config.polling_strategy == PollingStrategy::SessionGated
                    && !self.session_active;
                if started {
                    self.session_active = true;
                    self.tracker.rearm(now_ms);
                    info!("polling session started");
                    self.sync_status(now_ms);
                }
                let _ = reply.send(started);
                if started {
                    AfterCommand::PollNow
                } else {
                    AfterCommand::Continue
                }
            }
            Command::StopSession(reply) => {
                let stopped = self.session_active;
                if stopped {
                    self.session_active = false;
                    info!("polling session stopped");
                }
                let _ = reply.send(stopped);
                if stopped {
                    AfterCommand::Reschedule
                } else {
                    AfterCommand::Continue
                }
            }
        }
    }

    async fn write_pin(
        &mut self,
        pin: String,
        value: String,
        shutdown: &mut watch::Receiver<bool>,
    ) -> (Result<PinWriteOutcome, FetchError>, bool) {
        let source = Arc::clone(&self.source);
        let (write_pin, write_value) = (pin.clone(), value.clone());
        let written =
            isolated(async move { source.update_value(&write_pin, &write_value).await }).await;
        if let Err(err) = written {
            warn!(pin = %pin, "pin write failed: {err}");
            return (Err(err), false);
        }
        info!(pin = %pin, value = %value, "pin written");

        let Some(delay_ms) = self.config.command_confirm_delay_ms else {
            let outcome = PinWriteOutcome {
                pin,
                value,
                confirmed: None,
            };
            return (Ok(outcome), false);
        };

        let stopping = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
            _ = async {
                let _ = shutdown.wait_for(|stopping| *stopping).await;
            } => true,
        };
        if stopping {
            debug!(pin = %pin, "shutdown during write confirmation, skipping read-back");
            let outcome = PinWriteOutcome {
                pin,
                value,
                confirmed: None,
            };
            return (Ok(outcome), false);
        }

        let fetched = self.run_cycle().await;
        let confirmed = fetched
            && self
                .tracker
                .snapshot()
                .get(&pin)
                .map(|current| pin_value_matches(current, &value))
                .unwrap_or(false);
        if !confirmed {
            warn!(pin = %pin, value = %value, "pin write not confirmed by read-back");
        }

        let outcome = PinWriteOutcome {
            pin,
            value,
            confirmed: Some(confirmed),
        };
        (Ok(outcome), true)
    }

    /// Expires the reconnect window, settles the cadence tier and publishes the
    /// read-only status view.
    fn sync_status(&mut self, now_ms: u64) -> DeviceStatus {
        if self.reconnect.expire(now_ms) {
            info!("active check window ended");
        }

        if self.config.polling_strategy == PollingStrategy::SessionGated
            && self.session_active
            && !self.tracker.is_online()
            && self.tracker.is_stale(now_ms)
        {
            self.session_active = false;
            info!(
                stale_streak = self.tracker.stale_streak(),
                "device judged offline, ending polling session"
            );
        }

        let mode = if self.reconnect.is_active(now_ms) {
            DeviceMode::ActiveCheck
        } else if self.tracker.is_online() {
            DeviceMode::Fast
        } else {
            DeviceMode::Idle
        };
        if self.tracker.set_mode(mode) {
            info!(mode = mode.as_str(), "polling cadence changed");
        }

        let status = self.status(now_ms);
        self.notifier.publish_status(status.clone());
        status
    }

    fn status(&self, now_ms: u64) -> DeviceStatus {
        let window = self.reconnect.window();
        let wall = |ms: u64| wall_clock_at(ms, now_ms);
        DeviceStatus {
            online: self.tracker.is_online(),
            mode: self.tracker.mode().as_str(),
            last_heartbeat: self.tracker.last_heartbeat(),
            last_fresh_at: self.tracker.last_fresh_ms().map(wall),
            stale_streak: self.tracker.stale_streak(),
            snapshot: self.tracker.snapshot().clone(),
            polling_active: self.polling_enabled(now_ms),
            active_check_until: window.active_until_ms.map(wall),
            cooldown_until: (self.reconnect.cooldown_remaining_ms(now_ms) > 0)
                .then(|| wall(window.cooldown_until_ms)),
            observed_at: self.last_cycle_ms.map(wall),
        }
    }

    fn polling_enabled(&self, now_ms: u64) -> bool {
        match self.config.polling_strategy {
            PollingStrategy::AlwaysOn => true,
            PollingStrategy::SessionGated => {
                self.session_active || self.reconnect.is_active(now_ms)
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Runs a telemetry call on its own task so a panicking source cannot take the
/// polling loop down; a panic is reported as a network failure.
async fn isolated<T, F>(call: F) -> Result<T, FetchError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    tokio::spawn(call)
        .await
        .unwrap_or_else(|err| Err(FetchError::network(format!("telemetry task failed: {err}"))))
}

fn pin_value_matches(current: &serde_json::Value, expected: &str) -> bool {
    let expected = expected.trim();
    let as_number = |text: &str| text.trim().parse::<f64>().ok();
    match current {
        serde_json::Value::String(text) => {
            text.trim() == expected
                || matches!((as_number(text), as_number(expected)), (Some(a), Some(b)) if a == b)
        }
        serde_json::Value::Number(number) => {
            matches!((number.as_f64(), as_number(expected)), (Some(a), Some(b)) if a == b)
        }
        serde_json::Value::Bool(flag) => expected == if *flag { "1" } else { "0" },
        _ => false,
    }
}

fn wall_clock_at(ms: u64, now_ms: u64) -> DateTime<Utc> {
    let offset_ms = i64::try_from(ms)
        .unwrap_or(i64::MAX)
        .saturating_sub(i64::try_from(now_ms).unwrap_or(i64::MAX));
    Utc::now() + TimeDelta::try_milliseconds(offset_ms).unwrap_or_else(TimeDelta::zero)
}
