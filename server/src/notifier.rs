use pinwatch_common::{DeviceStatus, MonitorEvent};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_BUFFER: usize = 64;

/// Fan-out point between the polling task and dashboard subscribers.
#[derive(Debug, Clone)]
pub struct Notifier {
    events: broadcast::Sender<MonitorEvent>,
    status: watch::Sender<DeviceStatus>,
}

pub struct Subscription {
    pub initial: MonitorEvent,
    pub events: broadcast::Receiver<MonitorEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (status, _) = watch::channel(DeviceStatus::default());
        Self { events, status }
    }

    pub fn publish(&self, event: MonitorEvent) {
        let name = event.name();
        // No subscribers is the normal state when nobody has the dashboard open.
        let receivers = self.events.send(event).unwrap_or(0);
        debug!(event = name, receivers, "published monitor event");
    }

    pub fn publish_status(&self, status: DeviceStatus) {
        self.status.send_replace(status);
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    /// Attaches a subscriber. Live events are subscribed before the status is
    /// read so nothing published after `initial` can be missed.
    pub fn subscribe(&self) -> Subscription {
        let events = self.events.subscribe();
        let status = self.status.borrow();
        Subscription {
            initial: MonitorEvent::InitialState {
                snapshot: status.snapshot.clone(),
                online: status.online,
            },
            events,
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
