//! REST API handlers

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use gpushare_core::{CollectorReport, GpushareError, Reservation};
use gpushare_notify::ChannelBroadcaster;
use gpushare_reconciler::{IngestSummary, Reconciler};
use gpushare_scheduler::{NextAvailable, QueueEngine, Release};
use gpushare_store::{DeviceSnapshot, EntityStore};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<QueueEngine>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<EntityStore>,
    /// Subscriber side of the device state broadcaster
    pub events: Arc<ChannelBroadcaster>,
    /// Header carrying the authenticated username
    pub user_header: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:name", get(get_device))
        .route("/api/v1/devices/:name/events", get(device_events))
        .route("/api/v1/devices/:name/reserve", post(reserve_next))
        .route("/api/v1/gpus/:uuid/reserve", post(reserve_gpu))
        .route("/api/v1/gpus/:uuid/position", get(get_position))
        .route(
            "/api/v1/gpus/:uuid/reservations/:id/release",
            post(release_reservation),
        )
        .route(
            "/api/v1/gpus/:uuid/reservations/:id/cancel",
            post(cancel_reservation),
        )
        .route(
            "/api/v1/gpus/:uuid/reservations/:id/extend",
            post(extend_reservation),
        )
        .route("/api/v1/messages", post(send_message))
        .route("/api/v1/gpu/update", post(push_report))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(e: GpushareError) -> (StatusCode, String) {
    let status = match &e {
        GpushareError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        GpushareError::Unauthorized(_) => StatusCode::FORBIDDEN,
        GpushareError::NotFound(_) => StatusCode::NOT_FOUND,
        GpushareError::Policy(_) => StatusCode::CONFLICT,
        GpushareError::Ingestion(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, e.to_string())
}

/// Username of the caller, as set by the fronting proxy
fn actor(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(&state.user_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(GpushareError::Unauthenticated(format!(
                "Missing {} header",
                state.user_header
            )))
        })
}

/// Device token sent by a collector as `Token <token>` or `Bearer <token>`
fn collector_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Token ")
        .or_else(|| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

// Constant time over equal-length inputs.
fn tokens_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub devices: usize,
    pub gpus: usize,
    pub users: usize,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices: state.store.device_names().await.len(),
        gpus: state.store.gpu_count().await,
        users: state.store.users().await.len(),
    }))
}

/// List the devices the caller may use
async fn list_devices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<DeviceSnapshot>>> {
    let user = actor(&state, &headers)?;
    let snapshots = state
        .engine
        .visible_snapshots(&user)
        .await
        .map_err(error_response)?;
    Ok(Json(snapshots))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<DeviceSnapshot>> {
    let user = actor(&state, &headers)?;
    let snapshot = state
        .engine
        .device_snapshot(&name, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

/// Stream device snapshots as server-sent events
///
/// The first event is the current state; every later one follows a change.
async fn device_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user = actor(&state, &headers)?;
    state
        .engine
        .device_snapshot(&name, &user)
        .await
        .map_err(error_response)?;

    let updates = state.events.subscribe(&name).await;
    let initial = state
        .engine
        .device_snapshot(&name, &user)
        .await
        .and_then(|snapshot| snapshot.to_message())
        .map_err(error_response)?;
    info!(device = %name, user = %user, "Event stream opened");

    let stream = tokio_stream::once(initial)
        .chain(BroadcastStream::new(updates).filter_map(|message| message.ok()))
        .map(|data| Ok::<_, Infallible>(Event::default().event("snapshot").data(data)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Response to a next-available-spot request
#[derive(Debug, Serialize)]
pub struct ReserveNextResponse {
    /// A GPU was free and the single reservation is already active
    pub ready: bool,
    pub reservations: Vec<Reservation>,
}

impl From<NextAvailable> for ReserveNextResponse {
    fn from(outcome: NextAvailable) -> Self {
        match outcome {
            NextAvailable::Ready(reservation) => Self {
                ready: true,
                reservations: vec![reservation],
            },
            NextAvailable::Queued(reservations) => Self {
                ready: false,
                reservations,
            },
        }
    }
}

/// Reserve the next available GPU on a device
async fn reserve_next(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<ReserveNextResponse>> {
    let user = actor(&state, &headers)?;
    let outcome = state
        .engine
        .reserve_next_available(&name, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome.into()))
}

/// Reserve a specific GPU
async fn reserve_gpu(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Reservation>> {
    let user = actor(&state, &headers)?;
    let reservation = state
        .engine
        .reserve_specific(&uuid, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(reservation))
}

#[derive(Debug, Serialize)]
pub struct PositionResponse {
    pub gpu: String,
    /// Reservations ahead of the caller; absent when not queued
    pub position: Option<usize>,
}

async fn get_position(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<Json<PositionResponse>> {
    let user = actor(&state, &headers)?;
    let position = state
        .engine
        .queue_position(&uuid, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(PositionResponse {
        gpu: uuid,
        position,
    }))
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: Reservation,
    /// The reservation that took over the GPU
    pub promoted: Option<Reservation>,
}

impl From<Release> for ReleaseResponse {
    fn from(release: Release) -> Self {
        Self {
            released: release.released,
            promoted: release.promoted,
        }
    }
}

async fn release_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((uuid, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<ReleaseResponse>> {
    let user = actor(&state, &headers)?;
    let release = state
        .engine
        .release(&uuid, id, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(release.into()))
}

async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((uuid, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Reservation>> {
    let user = actor(&state, &headers)?;
    let cancelled = state
        .engine
        .cancel(&uuid, id, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(cancelled))
}

async fn extend_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((uuid, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Reservation>> {
    let user = actor(&state, &headers)?;
    let extended = state
        .engine
        .extend(&uuid, id, &user)
        .await
        .map_err(error_response)?;
    Ok(Json(extended))
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub device: String,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl From<IngestSummary> for IngestResponse {
    fn from(summary: IngestSummary) -> Self {
        Self {
            device: summary.device,
            created: summary.created,
            updated: summary.updated,
            skipped: summary.skipped,
        }
    }
}

/// Accept a report pushed by a collector
///
/// The collector authenticates with its device's API token. An unknown
/// device and a wrong token get the same answer.
async fn push_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(report): Json<CollectorReport>,
) -> ApiResult<Json<IngestResponse>> {
    let token = collector_token(&headers).ok_or_else(|| {
        error_response(GpushareError::Unauthenticated(
            "Missing device token".to_string(),
        ))
    })?;

    let expected = match state.store.device(&report.device_name).await {
        Ok(handle) => {
            let record = handle.lock().await;
            record.device.api_token.clone()
        }
        Err(_) => None,
    };
    let accepted = expected
        .as_deref()
        .is_some_and(|expected| tokens_match(expected, token));
    if !accepted {
        warn!(device = %report.device_name, "Rejected collector report");
        return Err(error_response(GpushareError::Unauthorized(
            "Invalid device token".to_string(),
        )));
    }

    let summary = state
        .reconciler
        .ingest(&report.device_name, &report)
        .await
        .map_err(error_response)?;
    Ok(Json(summary.into()))
}

/// A message from the caller to other users
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Send to every user; staff only
    #[serde(default)]
    pub all_users: bool,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Number of users the message went to
    pub sent: usize,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MessageRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let user = actor(&state, &headers)?;
    let sent = state
        .engine
        .send_message(
            &user,
            &request.recipients,
            request.all_users,
            &request.subject,
            &request.body,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(MessageResponse { sent }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use chrono::Utc;
    use gpushare_core::{
        Device, ManualClock, NotificationConfig, ReconcilerConfig, ReservationConfig, User,
    };
    use gpushare_notify::{MemoryNotifier, Notices};
    use tower::ServiceExt;

    const REPORT: &str = r#"{
        "device_name": "box",
        "gpu_data": [
            { "uuid": "GPU-1", "name": "Tesla K80",
              "memory": { "used": "10 MiB", "total": "11439 MiB" }, "in_use": "no" }
        ]
    }"#;

    const GHOST_REPORT: &str = r#"{ "device_name": "ghost", "gpu_data": [] }"#;

    async fn router() -> Router {
        let store = Arc::new(EntityStore::new());
        for name in ["alice", "bob"] {
            let mut user = User::new(name, format!("{}@example.org", name));
            user.staff = name == "alice";
            store.add_user(user).await;
        }
        let mut device = Device::new("box", "box:8080");
        device.api_token = Some("secret".to_string());
        store.add_device(device).await.unwrap();

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(MemoryNotifier::new());
        let events = Arc::new(ChannelBroadcaster::new());
        let notices = Notices::new(&NotificationConfig::default());

        let engine = Arc::new(QueueEngine::new(
            store.clone(),
            notifier.clone(),
            events.clone(),
            clock.clone(),
            notices.clone(),
            ReservationConfig::default(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            notifier,
            events.clone(),
            clock,
            notices,
            ReconcilerConfig::default(),
        ));

        create_router(AppState {
            engine,
            reconciler,
            store,
            events,
            user_header: "x-remote-user".to_string(),
        })
    }

    fn request(method: &str, uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-remote-user", user);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn push(authorization: Option<&str>, report: &'static str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/gpu/update")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(authorization) = authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        builder.body(Body::from(report)).unwrap()
    }

    fn message(user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-remote-user", user)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status() {
        let app = router().await;
        let response = app
            .oneshot(request("GET", "/api/v1/status", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["devices"], 1);
        assert_eq!(body["gpus"], 0);
        assert_eq!(body["users"], 2);
    }

    #[tokio::test]
    async fn test_actor_is_required() {
        let app = router().await;
        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/devices", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request("GET", "/api/v1/devices", Some("mallory")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_push_requires_device_token() {
        let app = router().await;

        let response = app.clone().oneshot(push(None, REPORT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(push(Some("Basic secret"), REPORT))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(push(Some("Token wrong"), REPORT))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(push(Some("Bearer secret"), REPORT))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["created"], 1);

        let response = app
            .oneshot(request("GET", "/api/v1/devices/box", Some("alice")))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["gpus"][0]["uuid"], "GPU-1");
        assert_eq!(body["gpus"][0]["memory"], "10 MiB / 11439 MiB");
    }

    #[tokio::test]
    async fn test_push_accepts_collector_token_scheme() {
        let app = router().await;
        let response = app
            .oneshot(push(Some("Token secret"), REPORT))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["device"], "box");
    }

    #[tokio::test]
    async fn test_push_hides_unknown_devices() {
        let app = router().await;
        let unknown = app
            .clone()
            .oneshot(push(Some("Token secret"), GHOST_REPORT))
            .await
            .unwrap();
        let wrong = app
            .oneshot(push(Some("Token wrong"), REPORT))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::FORBIDDEN);
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let unknown = axum::body::to_bytes(unknown.into_body(), usize::MAX)
            .await
            .unwrap();
        let wrong = axum::body::to_bytes(wrong.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(unknown, wrong);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("secret", "secret2"));
        assert!(!tokens_match("secret", ""));
    }

    #[tokio::test]
    async fn test_send_message() {
        let app = router().await;
        let response = app
            .clone()
            .oneshot(message(
                "bob",
                serde_json::json!({ "recipients": ["alice"], "subject": "GPU-1", "body": "Done soon?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["sent"], 1);

        let response = app
            .clone()
            .oneshot(message(
                "bob",
                serde_json::json!({ "all_users": true, "subject": "Everyone" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(message(
                "alice",
                serde_json::json!({ "all_users": true, "subject": "Maintenance", "body": "Down at noon" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["sent"], 1);

        let response = app
            .oneshot(message(
                "alice",
                serde_json::json!({ "recipients": ["ghost"], "subject": "Hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reservation_flow() {
        let app = router().await;
        app.clone()
            .oneshot(push(Some("Bearer secret"), REPORT))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/gpus/GPU-1/reserve", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let alice = json(response).await;
        let alice_id = alice["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/devices/box/reserve", Some("bob")))
            .await
            .unwrap();
        let bob = json(response).await;
        assert_eq!(bob["ready"], false);
        let bob_id = bob["reservations"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/gpus/GPU-1/position", Some("bob")))
            .await
            .unwrap();
        assert_eq!(json(response).await["position"], 1);

        let uri = format!("/api/v1/gpus/GPU-1/reservations/{}/cancel", alice_id);
        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let uri = format!("/api/v1/gpus/GPU-1/reservations/{}/release", alice_id);
        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some("bob")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let uri = format!("/api/v1/gpus/GPU-1/reservations/{}/extend", alice_id);
        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let uri = format!("/api/v1/gpus/GPU-1/reservations/{}/release", alice_id);
        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let release = json(response).await;
        assert_eq!(release["promoted"]["id"], bob_id.as_str());
        assert_eq!(release["promoted"]["user"], "bob");
    }

    #[tokio::test]
    async fn test_unknown_entities() {
        let app = router().await;
        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/devices/ghost", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("POST", "/api/v1/gpus/GPU-404/reserve", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_stream_opens() {
        let app = router().await;
        let response = app
            .oneshot(request("GET", "/api/v1/devices/box/events", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
    }
}
