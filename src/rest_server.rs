use crate::broadcast::{Hub, Identity};
use crate::metadata::{Category, Metadata, MetadataCache};
use crate::models::{Device, DeviceUpdate, NewDevice, Reading, Role, User, Viewer};
use crate::mqtt_service::{ConnectionInfo, ConnectionManager};
use crate::notifications::{self, Notification};
use crate::storage::{Storage, StorageError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 200;
const DEVICE_READINGS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub manager: Arc<ConnectionManager>,
    pub metadata: Arc<MetadataCache>,
    pub hub: Arc<Hub>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(StorageError::DeviceNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Storage(e) => {
                error!("Storage failure while serving request: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// The authenticated caller, resolved from `Authorization: Bearer <token>`.
pub struct AuthUser(pub User);

impl AuthUser {
    fn viewer(&self) -> Viewer {
        self.0.viewer()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
        let storage = Arc::clone(&state.storage);

        async move {
            let token = token.ok_or(ApiError::Unauthorized)?;
            storage
                .find_user_by_token(&token)
                .await?
                .map(AuthUser)
                .ok_or(ApiError::Unauthorized)
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", patch(update_device).delete(delete_device))
        .route("/api/devices/{id}/readings", get(device_readings))
        .route("/api/readings/types", get(reading_types))
        .route("/api/readings/types/pending", get(pending_types))
        .route("/api/readings/types/{key}", put(correct_type))
        .route("/api/readings/history", get(reading_history))
        .route("/api/connections", get(list_connections))
        .route("/api/notifications", get(list_notifications))
        .route("/api/user", get(current_user))
        .route("/api/users", post(create_user))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves.
pub async fn run_rest_server(
    state: AppState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("REST server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    subscribers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.manager.live_connections().len(),
        subscribers: state.hub.len(),
    })
}

async fn list_devices(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.storage.get_devices(&user.viewer()).await?))
}

async fn create_device(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<NewDevice>,
) -> Result<Json<Device>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("device name is required".to_string()));
    }
    let device = state.storage.create_device(&user.0.id, payload).await?;
    state.manager.sync().await?;
    Ok(Json(device))
}

/// Loads a device the caller may manage.
async fn owned_device(state: &AppState, user: &AuthUser, id: i64) -> Result<Device, ApiError> {
    let device = state.storage.get_device(id).await?.ok_or(ApiError::NotFound)?;
    if !user.viewer().can_access(&device) {
        return Err(ApiError::Forbidden);
    }
    Ok(device)
}

async fn update_device(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(update): Json<DeviceUpdate>,
) -> Result<Json<Device>, ApiError> {
    owned_device(&state, &user, id).await?;

    let reconnect = update.touches_connection();
    let updated = state.storage.update_device(id, update).await?;
    // A live connection keeps its original settings; drop it so sync reopens it.
    if reconnect {
        state.manager.disconnect(id);
    }
    state.manager.sync().await?;
    Ok(Json(updated))
}

async fn delete_device(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    owned_device(&state, &user, id).await?;
    state.storage.delete_device(id).await?;
    state.manager.sync().await?;
    Ok(StatusCode::OK)
}

async fn device_readings(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    owned_device(&state, &user, id).await?;
    Ok(Json(state.storage.get_readings(id, DEVICE_READINGS_LIMIT).await?))
}

async fn reading_types(State(state): State<AppState>, _user: AuthUser) -> Json<Vec<Metadata>> {
    Json(state.metadata.get_all())
}

async fn pending_types(State(state): State<AppState>, _user: AuthUser) -> Json<Vec<String>> {
    Json(state.metadata.pending())
}

#[derive(Deserialize)]
struct MetadataCorrection {
    label: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Category,
}

async fn correct_type(
    State(state): State<AppState>,
    user: AuthUser,
    Path(key): Path<String>,
    Json(correction): Json<MetadataCorrection>,
) -> Result<Json<Metadata>, ApiError> {
    if !user.viewer().is_admin() {
        return Err(ApiError::Forbidden);
    }
    if correction.label.trim().is_empty() {
        return Err(ApiError::BadRequest("label is required".to_string()));
    }
    let metadata = Metadata {
        original_key: key.clone(),
        label: correction.label,
        unit: correction.unit,
        description: correction.description,
        category: correction.category,
    };
    state.metadata.set(&key, metadata.clone());
    info!(key = %key, user = %user.0.id, "reading type metadata corrected");
    Ok(Json(metadata))
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn reading_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.storage.get_recent_readings(&user.viewer(), limit).await?))
}

async fn list_connections(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<ConnectionInfo>>, ApiError> {
    if !user.viewer().is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.manager.live_connections()))
}

async fn list_notifications(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let viewer = user.viewer();
    let devices = state.storage.get_devices(&viewer).await?;
    let readings = state
        .storage
        .get_recent_readings(&viewer, notifications::READING_WINDOW)
        .await?;
    Ok(Json(notifications::build(&devices, &readings, OffsetDateTime::now_utc())))
}

async fn current_user(user: AuthUser) -> Json<User> {
    Json(user.0)
}

#[derive(Deserialize)]
struct NewUser {
    username: String,
    role: Option<Role>,
}

/// A provisioned account together with its freshly issued API token.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssuedUser {
    #[serde(flatten)]
    user: User,
    api_token: String,
}

/// Creates an account, or issues a new token for an existing username.
async fn create_user(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<NewUser>,
) -> Result<Json<IssuedUser>, ApiError> {
    if !user.viewer().is_admin() {
        return Err(ApiError::Forbidden);
    }
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username is required".to_string()));
    }

    let stored = state
        .storage
        .ensure_user(User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            role: payload.role.unwrap_or(Role::User),
            api_token: Uuid::new_v4().simple().to_string(),
        })
        .await?;
    info!(user = %stored.id, username = %stored.username, "API token issued");
    Ok(Json(IssuedUser {
        api_token: stored.api_token.clone(),
        user: stored,
    }))
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Auth { token: String },
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn authenticate(state: &AppState, token: &str) -> Option<Identity> {
    match state.storage.find_user_by_token(token).await {
        Ok(Some(user)) => Some(Identity {
            user_id: user.id,
            role: user.role,
        }),
        Ok(None) => None,
        Err(e) => {
            error!("Failed to resolve subscriber token: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let (subscriber_id, mut events) = state.hub.open();
    info!("Subscriber {} connected", subscriber_id);

    if let Some(token) = token {
        match authenticate(&state, &token).await {
            Some(identity) => {
                state.hub.register(subscriber_id, identity);
            }
            None => warn!("Subscriber {} presented an unknown token", subscriber_id),
        }
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Auth { token }) = serde_json::from_str::<ClientMessage>(text.as_str()) {
                            match authenticate(&state, &token).await {
                                Some(identity) => {
                                    state.hub.register(subscriber_id, identity);
                                }
                                None => warn!("Subscriber {} presented an unknown token", subscriber_id),
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            outgoing = events.recv() => {
                let Some(payload) = outgoing else { break };
                if sink.send(Message::Text(payload.as_ref().into())).await.is_err() {
                    break; // client disconnected
                }
            }
        }
    }

    state.hub.close(subscriber_id);
    info!("Subscriber {} disconnected", subscriber_id);
}
