use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::Stream;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::ack::{AckError, AckHub, AckReceipt, AckRequest, ClientSession, Notice};
use crate::audit::{AuditSink, AuditStatus};
use crate::config::MonitorSection;
use crate::health::lifecycle::ContainerLifecycle;
use crate::health::{HealthMonitorOptions, MonitorRegistry, start_health_monitor};
use crate::metrics::GuardMetrics;
use crate::runtime::{ContainerRef, ContainerRuntime};
use crate::self_update::SelfUpdateLaunch;
use crate::store::BackupStore;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// State shared across axum handlers.
pub struct AppState {
    pub hub: Arc<AckHub>,
    pub monitors: MonitorRegistry,
    pub metrics: Arc<GuardMetrics>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub lifecycle: Arc<dyn ContainerLifecycle>,
    pub backups: Arc<dyn BackupStore>,
    pub audit: Arc<dyn AuditSink>,
    pub launcher: Arc<dyn SelfUpdateLaunch>,
    pub monitor_defaults: MonitorSection,
}

type HandlerError = (StatusCode, String);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(events))
        .route("/self-update", post(self_update))
        .route("/self-update/{op_id}/ack", post(acknowledge))
        .route(
            "/containers/{name}/monitor",
            put(start_monitor).delete(stop_monitor),
        )
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then cancel every running monitor.
pub async fn serve(
    state: Arc<AppState>,
    listen: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = router(state.clone());

    info!("Starting HTTP service on {listen}");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    state.monitors.cancel_all().await;
    info!("HTTP service stopped");
    result
}

/// Unregisters the client once its stream is dropped.
struct ClientStream {
    hub: Arc<AckHub>,
    session: ClientSession,
    receiver: broadcast::Receiver<Notice>,
    greeted: bool,
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.hub.disconnect(&self.session.client_id);
    }
}

fn notice_event(notice: &Notice) -> Result<Event, axum::Error> {
    Event::default()
        .event("self-update")
        .id(notice.event_id.to_string())
        .json_data(&notice.event)
}

fn client_events(hub: Arc<AckHub>) -> impl Stream<Item = Result<Event, axum::Error>> {
    let (session, receiver) = hub.connect();
    let client = ClientStream {
        hub,
        session,
        receiver,
        greeted: false,
    };

    futures_util::stream::unfold(client, |mut client| async move {
        if !client.greeted {
            client.greeted = true;
            let event = Event::default()
                .event("connected")
                .json_data(client.session);
            return Some((event, client));
        }
        loop {
            match client.receiver.recv().await {
                Ok(notice) => return Some((notice_event(&notice), client)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Client {} lagged behind, {skipped} event(s) dropped",
                        client.session.client_id
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Sse::new(client_events(state.hub.clone()))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("keep-alive"))
}

fn ack_error_status(err: &AckError) -> StatusCode {
    match err {
        AckError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        AckError::UnknownClient(_) | AckError::InvalidToken(_) => StatusCode::FORBIDDEN,
    }
}

async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Path(op_id): Path<String>,
    Json(request): Json<AckRequest>,
) -> Result<(StatusCode, Json<AckReceipt>), HandlerError> {
    let receipt = state.hub.acknowledge(&op_id, &request).map_err(|e| {
        debug!("Rejected ack for {op_id}: {e}");
        (ack_error_status(&e), e.to_string())
    })?;
    state.metrics.ack();
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct SelfUpdateRequest {
    pub image: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelfUpdateAccepted {
    pub op_id: String,
}

async fn self_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelfUpdateRequest>,
) -> Result<(StatusCode, Json<SelfUpdateAccepted>), HandlerError> {
    let image = request.image.trim().to_string();
    if image.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "image must not be empty".to_string()));
    }

    let op_id = Uuid::now_v7().to_string();
    state.hub.announce_self_update(&op_id);

    let launcher = state.launcher.clone();
    let metrics = state.metrics.clone();
    let task_op_id = op_id.clone();
    tokio::spawn(async move {
        match launcher.launch(&task_op_id, &image).await {
            Ok(_) => metrics.self_update_launch(AuditStatus::Success),
            Err(e) => {
                error!("[self-update:{task_op_id}] launch failed: {e}");
                metrics.self_update_launch(AuditStatus::Error);
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SelfUpdateAccepted { op_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRequest {
    pub current_tag: String,
    pub window_ms: Option<u64>,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorAccepted {
    pub container_id: String,
    pub container_name: String,
    pub current_tag: String,
    pub window_ms: u64,
    pub interval_ms: u64,
}

async fn start_monitor(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<MonitorRequest>,
) -> Result<(StatusCode, Json<MonitorAccepted>), HandlerError> {
    let window_ms = request.window_ms.unwrap_or(state.monitor_defaults.window_ms);
    let interval_ms = request
        .interval_ms
        .unwrap_or(state.monitor_defaults.interval_ms);
    if window_ms == 0 || interval_ms == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "windowMs and intervalMs must be greater than zero".to_string(),
        ));
    }

    let container = state.runtime.inspect(&name).await.map_err(|e| {
        if e.is_not_found() {
            (StatusCode::NOT_FOUND, format!("container {name} not found"))
        } else {
            error!("Failed to inspect container {name}: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string())
        }
    })?;

    let handle = start_health_monitor(HealthMonitorOptions {
        runtime: state.runtime.clone(),
        container: ContainerRef::new(container.id.clone(), container.name.clone()),
        current_tag: request.current_tag.clone(),
        window: Duration::from_millis(window_ms),
        interval: Duration::from_millis(interval_ms),
        lifecycle: state.lifecycle.clone(),
        backups: state.backups.clone(),
        audit: state.audit.clone(),
        metrics: state.metrics.clone(),
    });
    state.monitors.insert(handle).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(MonitorAccepted {
            container_id: container.id,
            container_name: container.name,
            current_tag: request.current_tag,
            window_ms,
            interval_ms,
        }),
    ))
}

async fn stop_monitor(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> StatusCode {
    if state.monitors.cancel(&name).await {
        info!("Health monitor for {name} cancelled");
    }
    StatusCode::NO_CONTENT
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, HandlerError> {
    let body = state.metrics.encode().map_err(|e| {
        error!("Failed to encode metrics: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::JsonlAuditLog;
    use crate::health::lifecycle::DockerLifecycle;
    use crate::runtime::mock::{MockContainer, MockRuntime};
    use crate::runtime::HealthStatus;
    use crate::self_update::UpdateOperation;
    use crate::self_update::launcher::LaunchError;
    use crate::store::FileBackupStore;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    struct FakeLauncher {
        launched: mpsc::UnboundedSender<(String, String)>,
        fail: bool,
    }

    #[async_trait]
    impl SelfUpdateLaunch for FakeLauncher {
        async fn launch(&self, op_id: &str, image: &str) -> Result<UpdateOperation, LaunchError> {
            let _ = self.launched.send((op_id.to_string(), image.to_string()));
            if self.fail {
                return Err(LaunchError::MissingId("drydock".to_string()));
            }
            Ok(UpdateOperation {
                op_id: op_id.to_string(),
                old: ContainerRef::new("old-id", "drydock"),
                candidate_id: "new-id".to_string(),
                start_timeout: Duration::from_secs(30),
                health_timeout: Duration::from_secs(120),
                poll_interval: Duration::from_secs(1),
            })
        }
    }

    fn temp_path(ext: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("drydock-guard-server-{}.{ext}", Uuid::now_v7()))
    }

    fn state_with(
        runtime: MockRuntime,
        fail_launch: bool,
    ) -> (Arc<AppState>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = AppState {
            hub: Arc::new(AckHub::new(Duration::from_secs(10))),
            monitors: MonitorRegistry::new(),
            metrics: Arc::new(GuardMetrics::new().unwrap()),
            runtime: Arc::new(runtime),
            lifecycle: Arc::new(DockerLifecycle::default()),
            backups: Arc::new(FileBackupStore::new(temp_path("json"))),
            audit: Arc::new(JsonlAuditLog::new(temp_path("jsonl"))),
            launcher: Arc::new(FakeLauncher {
                launched: tx,
                fail: fail_launch,
            }),
            monitor_defaults: MonitorSection::default(),
        };
        (Arc::new(state), rx)
    }

    #[tokio::test]
    async fn test_event_stream_registers_client() {
        let (state, _rx) = state_with(MockRuntime::new(), false);

        let mut stream = Box::pin(client_events(state.hub.clone()));
        assert_eq!(state.hub.connected_clients(), 1);
        assert!(stream.next().await.unwrap().is_ok());

        state.hub.announce_self_update("op-1");
        assert!(stream.next().await.unwrap().is_ok());

        drop(stream);
        assert_eq!(state.hub.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_ack_status_codes() {
        let (state, _rx) = state_with(MockRuntime::new(), false);
        let (session, _events) = state.hub.connect();
        state.hub.announce_self_update("op-1");

        let request = |token: String| AckRequest {
            client_id: session.client_id.to_string(),
            client_token: token,
            last_event_id: Some("1".to_string()),
        };

        let (status, Json(receipt)) = acknowledge(
            State(state.clone()),
            Path("op-1".to_string()),
            Json(request(session.client_token.to_string())),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(receipt.acknowledged, 1);
        assert_eq!(receipt.connected_clients, 1);

        let (status, _) = acknowledge(
            State(state.clone()),
            Path("op-2".to_string()),
            Json(request(session.client_token.to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = acknowledge(
            State(state.clone()),
            Path("op-1".to_string()),
            Json(request(Uuid::new_v4().to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);

        let body = state.metrics.encode().unwrap();
        assert!(body.contains("drydock_self_update_acks_total 1"));
    }

    #[tokio::test]
    async fn test_self_update_answers_before_launch_completes() {
        let (state, mut launched) = state_with(MockRuntime::new(), false);
        let (_session, mut events) = state.hub.connect();

        let (status, Json(accepted)) = self_update(
            State(state.clone()),
            Json(SelfUpdateRequest {
                image: "ghcr.io/acme/drydock:2.0.0".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let notice = events.recv().await.unwrap();
        assert_eq!(notice.event.op_id, accepted.op_id);

        let (op_id, image) = launched.recv().await.unwrap();
        assert_eq!(op_id, accepted.op_id);
        assert_eq!(image, "ghcr.io/acme/drydock:2.0.0");
    }

    #[tokio::test]
    async fn test_self_update_rejects_empty_image() {
        let (state, _rx) = state_with(MockRuntime::new(), false);
        let (status, _) = self_update(
            State(state),
            Json(SelfUpdateRequest {
                image: "  ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_failed_launch_is_counted() {
        let (state, mut launched) = state_with(MockRuntime::new(), true);
        self_update(
            State(state.clone()),
            Json(SelfUpdateRequest {
                image: "ghcr.io/acme/drydock:2.0.0".to_string(),
            }),
        )
        .await
        .unwrap();
        launched.recv().await.unwrap();

        // The counter is bumped right after the launcher returns.
        for _ in 0..100 {
            if state
                .metrics
                .encode()
                .unwrap()
                .contains("drydock_self_update_launch_total{status=\"error\"} 1")
            {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("launch failure was not counted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_registration() {
        let runtime = MockRuntime::new().with_container(
            "web",
            MockContainer::new("web", true).with_health(&[Some(HealthStatus::Starting)]),
        );
        let (state, _rx) = state_with(runtime, false);

        let (status, Json(accepted)) = start_monitor(
            State(state.clone()),
            Path("web".to_string()),
            Json(MonitorRequest {
                current_tag: "1.3.0".to_string(),
                window_ms: Some(60_000),
                interval_ms: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted.window_ms, 60_000);
        assert_eq!(accepted.interval_ms, 10_000);
        assert_eq!(state.monitors.len().await, 1);

        let status = stop_monitor(State(state.clone()), Path("web".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let status = stop_monitor(State(state.clone()), Path("web".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.monitors.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stopped_by_container_id() {
        let runtime = MockRuntime::new().with_container(
            "abc123def456",
            MockContainer::new("web", true).with_health(&[Some(HealthStatus::Starting)]),
        );
        let (state, _rx) = state_with(runtime, false);

        start_monitor(
            State(state.clone()),
            Path("abc123def456".to_string()),
            Json(MonitorRequest {
                current_tag: "1.3.0".to_string(),
                window_ms: None,
                interval_ms: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(state.monitors.len().await, 1);

        let status = stop_monitor(State(state.clone()), Path("abc123def456".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.monitors.len().await, 0);
    }

    #[tokio::test]
    async fn test_monitor_rejects_bad_requests() {
        let (state, _rx) = state_with(MockRuntime::new(), false);

        let (status, _) = start_monitor(
            State(state.clone()),
            Path("web".to_string()),
            Json(MonitorRequest {
                current_tag: "1.3.0".to_string(),
                window_ms: Some(0),
                interval_ms: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = start_monitor(
            State(state),
            Path("missing".to_string()),
            Json(MonitorRequest {
                current_tag: "1.3.0".to_string(),
                window_ms: None,
                interval_ms: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
