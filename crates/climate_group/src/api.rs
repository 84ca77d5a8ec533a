use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::climate::GroupCommand;
use crate::climate::GroupError;
use crate::engine::Attributes;
use crate::engine::Engine;
use crate::engine::EntityState;
use crate::engine::Host;
use crate::engine::MemoryHost;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    groups: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Body of PUT /v1/entities/:entity_id
#[derive(Debug, Deserialize)]
struct EntityUpdate {
    state: String,
    #[serde(default)]
    attributes: Attributes,
}

/// Shared application state
pub struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
    /// Present when the engine runs against simulated devices, which can then
    /// be changed through the API.
    simulation: Option<Arc<MemoryHost>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, simulation: Option<Arc<MemoryHost>>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            engine,
            simulation,
        }
    }
}

fn error(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for GroupError {
    fn into_response(self) -> Response {
        let status = match self {
            GroupError::UnknownGroup(_) => StatusCode::NOT_FOUND,
            GroupError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            GroupError::UnsupportedHvacMode(_) | GroupError::Unsupported(_) | GroupError::Empty(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        error(status, self)
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            groups: state.engine.groups().count(),
        }),
    )
}

/// Handler for GET /v1/groups
#[tracing::instrument(skip(state))]
async fn list_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.state_snapshot())
}

/// Handler for GET /v1/groups/:key
#[tracing::instrument(skip(state))]
async fn get_group(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.engine.group(&key) {
        Some(group) => Json(group.snapshot().as_ref().clone()).into_response(),
        None => GroupError::UnknownGroup(key).into_response(),
    }
}

/// Handler for POST /v1/groups/:key/command
#[tracing::instrument(skip(state))]
async fn command_group(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(command): Json<GroupCommand>,
) -> Response {
    match state.engine.command(&key, command).await {
        Ok(()) => match state.engine.group(&key) {
            Some(group) => Json(group.snapshot().as_ref().clone()).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

/// Handler for GET /v1/entities/:entity_id
#[tracing::instrument(skip(state))]
async fn get_entity(State(state): State<Arc<AppState>>, Path(entity_id): Path<String>) -> Response {
    match state.engine.host().get_state(&entity_id) {
        Some(entity) => Json(entity).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown entity: {}", entity_id)),
    }
}

/// Handler for PUT /v1/entities/:entity_id
///
/// Changes a simulated device as if it was operated by hand.
#[tracing::instrument(skip(state))]
async fn put_entity(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(update): Json<EntityUpdate>,
) -> Response {
    let Some(host) = &state.simulation else {
        return error(StatusCode::METHOD_NOT_ALLOWED, "entities are read-only");
    };

    let mut entity = EntityState::new(entity_id.as_str(), update.state);
    entity.attributes = update.attributes;
    host.set_state(entity, None);

    match host.get_state(&entity_id) {
        Some(entity) => Json(entity).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/:key", get(get_group))
        .route("/v1/groups/:key/command", post(command_group))
        .route("/v1/entities/:entity_id", get(get_entity).put(put_entity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: IpAddr,
    port: u16,
    state: Arc<AppState>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = create_router(state);

    let addr = SocketAddr::new(listen, port);
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Method;
    use axum::http::Request;
    use serde_json::json;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::GroupConfig;
    use crate::engine::Behaviour;

    fn setup() -> (Arc<MemoryHost>, Arc<Engine>, Router) {
        let host = Arc::new(MemoryHost::new());
        host.insert(
            EntityState::new("climate.a", "off")
                .with_attribute("temperature", 20.0)
                .with_attribute("current_temperature", 19.0)
                .with_attribute("hvac_modes", json!(["off", "heat"]))
                .with_attribute("supported_features", 1 | 128 | 256),
            Behaviour::Responsive,
        );

        let mut engine = Engine::new(host.clone(), None);
        engine.register_group(GroupConfig::new("living", &["climate.a"]));
        let engine = Arc::new(engine);
        let router = create_router(Arc::new(AppState::new(engine.clone(), Some(host.clone()))));
        (host, engine, router)
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_and_info() {
        let (_host, _engine, router) = setup();

        let (status, body) = send(&router, Method::GET, "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        let (status, body) = send(&router, Method::GET, "/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groups"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_group() {
        let (_host, _engine, router) = setup();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (status, body) = send(&router, Method::GET, "/v1/groups/living", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entity_id"], json!("climate.living"));
        assert_eq!(body["attributes"]["hvac_mode"], json!("off"));

        let (status, body) = send(&router, Method::GET, "/v1/groups/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("unknown group: nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command() {
        let (host, _engine, router) = setup();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/v1/groups/living/command",
            Some(json!({"command": "set_hvac_mode", "hvac_mode": "heat"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"]["hvac_mode"], json!("heat"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.get_state("climate.a").unwrap().state, "heat");

        let (status, _) = send(
            &router,
            Method::POST,
            "/v1/groups/living/command",
            Some(json!({"command": "set_hvac_mode", "hvac_mode": "dry"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_entity() {
        let (host, _engine, router) = setup();

        let (status, body) = send(
            &router,
            Method::PUT,
            "/v1/entities/binary_sensor.window",
            Some(json!({"state": "on"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("on"));
        assert_eq!(host.get_state("binary_sensor.window").unwrap().state, "on");

        let (status, body) = send(&router, Method::GET, "/v1/entities/binary_sensor.window", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entity_id"], json!("binary_sensor.window"));
    }
}
