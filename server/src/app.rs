use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use pinwatch_common::{DeviceStatus, MonitorEvent};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, WatchStream},
    Stream, StreamExt,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::{
    notifier::{Notifier, Subscription},
    safety::build_safety_hook,
    scheduler::{CommandError, PollingScheduler, SchedulerHandle},
    store::{self, ConfigStore},
    telemetry::{CloudClient, TelemetrySource},
};

#[derive(Clone)]
struct AppState {
    scheduler: SchedulerHandle,
    notifier: Notifier,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct CooldownBody {
    error: String,
    #[serde(rename = "remainingMs")]
    remaining_ms: u64,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    changed: bool,
    status: DeviceStatus,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let env = |key: &str| std::env::var(key).ok();
    let store = ConfigStore::from_env();
    let mut runtime = store
        .load()
        .await
        .with_context(|| format!("failed to load config from {}", store.path().display()))?;
    store::apply_env_overrides(&mut runtime, env);
    runtime.cloud.sanitize();
    runtime
        .cloud
        .validate()
        .with_context(|| format!("set {} or cloud.authToken", store::ENV_TOKEN))?;
    runtime
        .monitor
        .validate()
        .context("invalid monitor configuration")?;

    let monitor = runtime.monitor;
    let client = CloudClient::new(
        &runtime.cloud,
        monitor.monitored_pins.clone(),
        Duration::from_millis(monitor.fetch_timeout_ms),
    )
    .context("failed to build cloud api client")?;
    let source: Arc<dyn TelemetrySource> = Arc::new(client);
    let safety = build_safety_hook(&monitor, Arc::clone(&source));

    let notifier = Notifier::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scheduler, scheduler_task) =
        PollingScheduler::new(monitor, source, safety, notifier.clone()).spawn(shutdown_rx.clone());

    let app_state = AppState {
        scheduler,
        notifier,
        shutdown: shutdown_rx,
    };

    let web_root = store::web_root(env);
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/reconnect", post(handle_reconnect))
        .route("/api/pin", post(handle_write_pin))
        .route("/api/session/start", post(handle_session_start))
        .route("/api/session/stop", post(handle_session_stop))
        .route("/api/events", get(handle_events))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], store::http_port(env)));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind monitor server at {addr}"))?;

    info!("monitor listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_ctrl_c().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    scheduler_task
        .await
        .context("polling scheduler task failed")?;
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.notifier.status())
}

async fn handle_reconnect(State(state): State<AppState>) -> axum::response::Response {
    match state.scheduler.request_manual_check().await {
        Ok(_) => (StatusCode::ACCEPTED, Json(state.notifier.status())).into_response(),
        Err(err) => command_error_response(err),
    }
}

async fn handle_write_pin(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let pin = params
        .get("pin")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    let Some(pin) = pin else {
        return error_response(StatusCode::BAD_REQUEST, "missing pin");
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "missing value");
    };

    match state.scheduler.write_pin(pin, value.as_str()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => command_error_response(err),
    }
}

async fn handle_session_start(State(state): State<AppState>) -> axum::response::Response {
    match state.scheduler.start_session().await {
        Ok(changed) => session_response(&state, changed),
        Err(err) => command_error_response(err),
    }
}

async fn handle_session_stop(State(state): State<AppState>) -> axum::response::Response {
    match state.scheduler.stop_session().await {
        Ok(changed) => session_response(&state, changed),
        Err(err) => command_error_response(err),
    }
}

fn session_response(state: &AppState, changed: bool) -> axum::response::Response {
    Json(SessionResponse {
        changed,
        status: state.notifier.status(),
    })
    .into_response()
}

async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = event_stream(state.notifier.subscribe(), state.shutdown.clone()).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.name()).data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// The subscriber's initial state, then live events until shutdown. A
/// subscriber that falls behind skips what it missed.
fn event_stream(
    subscription: Subscription,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = MonitorEvent> {
    let live = tokio_stream::once(subscription.initial)
        .chain(
            BroadcastStream::new(subscription.events).filter_map(|received| match received {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                    None
                }
            }),
        )
        .map(Some);
    let stop = WatchStream::new(shutdown)
        .filter(|stopping| *stopping)
        .map(|_| None);

    live.merge(stop)
        .take_while(Option::is_some)
        .filter_map(|event| event)
}

fn command_error_response(err: CommandError) -> axum::response::Response {
    match err {
        CommandError::Cooldown(cooldown) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(CooldownBody {
                error: cooldown.to_string(),
                remaining_ms: cooldown.remaining_ms,
            }),
        )
            .into_response(),
        CommandError::Fetch(err) if err.is_upstream_rejected() => {
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
        CommandError::Fetch(err) => error_response(StatusCode::GATEWAY_TIMEOUT, &err.to_string()),
        CommandError::Stopped => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &CommandError::Stopped.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinwatch_common::{CooldownError, FetchError, PinSnapshot};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn data_update(value: i64) -> MonitorEvent {
        MonitorEvent::DataUpdated {
            snapshot: PinSnapshot::from([("V0".to_string(), json!(value))]),
            online: true,
            fresh: true,
        }
    }

    #[tokio::test]
    async fn stream_starts_with_initial_state_and_ends_on_shutdown() {
        let notifier = Notifier::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stream = std::pin::pin!(event_stream(notifier.subscribe(), shutdown_rx));

        notifier.publish(MonitorEvent::StatusChanged { online: true });

        assert_eq!(
            stream.next().await,
            Some(MonitorEvent::InitialState {
                snapshot: PinSnapshot::new(),
                online: false
            })
        );
        assert_eq!(
            stream.next().await,
            Some(MonitorEvent::StatusChanged { online: true })
        );

        shutdown_tx.send(true).unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_missed_events() {
        let notifier = Notifier::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stream = std::pin::pin!(event_stream(notifier.subscribe(), shutdown_rx));

        for value in 0..70 {
            notifier.publish(data_update(value));
        }

        assert!(matches!(
            stream.next().await,
            Some(MonitorEvent::InitialState { .. })
        ));
        assert_eq!(stream.next().await, Some(data_update(6)));
    }

    #[test]
    fn cooldown_maps_to_too_many_requests() {
        let response =
            command_error_response(CommandError::Cooldown(CooldownError { remaining_ms: 20_000 }));

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn fetch_errors_map_to_gateway_statuses() {
        let rejected = command_error_response(CommandError::Fetch(FetchError::rejected(401, "")));
        let network = command_error_response(CommandError::Fetch(FetchError::network("reset")));
        let stopped = command_error_response(CommandError::Stopped);

        assert_eq!(rejected.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(network.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(stopped.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
