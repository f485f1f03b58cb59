//! HTTP surface: router, auth middleware and the message endpoints
//!
//! Everything except the health probe requires a bearer token. Errors render
//! as `{"error": ...}` JSON with taxonomy-mapped status codes.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{AuthUser, TokenVerifier};
use crate::config::ServerConfig;
use crate::error::{ChatError, Result};
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::protocol::{ChatEvent, EventKind, escape_body};
use crate::server::room_manager::RoomManager;
use crate::server::ws::{self, WsConnLimiter};
use crate::store::{MessageStore, NewMessage, PersistQueue, StoredMessage};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub store: Arc<dyn MessageStore>,
    pub queue: Arc<PersistQueue>,
    pub presence: Arc<dyn PresenceStore>,
    pub verifier: Arc<TokenVerifier>,
    pub conn_limiter: Arc<WsConnLimiter>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<ServerConfig>,
}

/// Build the full router: open health probe plus the authenticated surface.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/rooms/{id}/ws", get(ws::room_ws))
        .route("/rooms/{id}/messages", get(room_history))
        .route(
            "/rooms/{id}/messages/{msg_id}",
            put(edit_message).delete(delete_message),
        )
        .route("/rooms/{id}/messages/{msg_id}/reply", post(reply_message))
        .route("/rooms/{id}/members", get(room_members))
        .route("/rooms/{id}/online", get(room_online))
        .route("/rooms/{id}/typing", get(room_typing))
        .route("/rooms/{id}/kick", post(kick_user))
        .route("/rooms/{id}/announce", post(announce))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health_check))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pull the bearer token from the Authorization header or, for WebSocket
/// clients that cannot set headers, a `token` query parameter.
fn bearer_token(req: &Request) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|param| param.strip_prefix("token="))
            .map(|token| token.to_string())
    })
}

/// Authenticate the request and stash the identity in extensions
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token =
        bearer_token(&req).ok_or_else(|| ChatError::unauthenticated("missing bearer token"))?;
    let user = state.verifier.verify(&token)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /rooms/{id}/messages — bounded recent history
async fn room_history(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>> {
    let messages = state
        .store
        .recent(&room_id, state.config.replay_limit)
        .await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    message: String,
}

fn validate_body(state: &AppState, body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(ChatError::bad_request("message must not be empty"));
    }
    if body.chars().count() > state.config.max_body_chars {
        return Err(ChatError::bad_request(
            "message may not exceed 2000 characters",
        ));
    }
    Ok(())
}

/// Best-effort live notification; the durable write already happened.
async fn notify_room(state: &AppState, room_id: &str, event: ChatEvent) {
    if let Some(hub) = state.manager.get(room_id).await {
        if let Err(e) = hub.broadcast(event).await {
            warn!(room_id, error = ?e, "room notification not delivered");
        }
    }
}

/// PUT /rooms/{id}/messages/{msg_id} — edit within the 5-minute window
async fn edit_message(
    State(state): State<AppState>,
    Path((room_id, msg_id)): Path<(String, String)>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<StoredMessage>> {
    validate_body(&state, &req.message)?;
    let body = escape_body(&req.message);

    let updated = state
        .store
        .edit(&room_id, &msg_id, &user.username, &body)
        .await?;

    let mut event = ChatEvent::new(EventKind::MsgEdit, &user.username, &room_id)
        .with_body(updated.body.clone())
        .with_message_id(msg_id);
    event.created_at = Some(updated.created_at.to_rfc3339());
    notify_room(&state, &room_id, event).await;

    Ok(Json(updated))
}

#[derive(Serialize)]
struct DeletedResponse {
    message: &'static str,
}

/// DELETE /rooms/{id}/messages/{msg_id} — soft delete by the author
async fn delete_message(
    State(state): State<AppState>,
    Path((room_id, msg_id)): Path<(String, String)>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<DeletedResponse>> {
    state.store.delete(&msg_id, &user.username).await?;

    let event =
        ChatEvent::new(EventKind::MsgDelete, &user.username, &room_id).with_message_id(msg_id);
    notify_room(&state, &room_id, event).await;

    Ok(Json(DeletedResponse {
        message: "message deleted",
    }))
}

#[derive(Debug, Deserialize)]
struct ReplyMessageRequest {
    message: String,
}

/// POST /rooms/{id}/messages/{msg_id}/reply — threaded reply
async fn reply_message(
    State(state): State<AppState>,
    Path((room_id, msg_id)): Path<(String, String)>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ReplyMessageRequest>,
) -> Result<(axum::http::StatusCode, Json<StoredMessage>)> {
    validate_body(&state, &req.message)?;

    // The parent must exist in this room
    let parent = state
        .store
        .get(&msg_id)
        .await?
        .ok_or_else(|| ChatError::not_found("parent message not found"))?;
    if parent.room_id != room_id {
        return Err(ChatError::not_found("parent message not found"));
    }

    let body = escape_body(&req.message);
    let saved = state
        .store
        .insert_one(NewMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            user: user.username.clone(),
            body: body.clone(),
            reply_to: Some(msg_id.clone()),
            encrypted: false,
            encrypted_keys: None,
            created_at: chrono::Utc::now(),
        })
        .await?;

    let mut event = ChatEvent::new(EventKind::Msg, &user.username, &room_id)
        .with_body(body)
        .with_message_id(saved.id.clone());
    event.reply_to = Some(msg_id);
    event.created_at = Some(saved.created_at.to_rfc3339());
    notify_room(&state, &room_id, event).await;

    Ok((axum::http::StatusCode::CREATED, Json(saved)))
}

/// GET /rooms/{id}/members — live participants on this instance
async fn room_members(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(state.manager.online_members(&room_id).await))
}

/// GET /rooms/{id}/online — presence-backed online list.
/// Falls back to the local hub's members if the presence store is down.
async fn room_online(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<String>>> {
    match state.presence.list_online(&room_id).await {
        Ok(users) => Ok(Json(users)),
        Err(e) => {
            warn!(room_id = %room_id, error = %e, "presence read failed, using local hub");
            Ok(Json(state.manager.online_members(&room_id).await))
        }
    }
}

/// GET /rooms/{id}/typing — who is typing right now
async fn room_typing(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let users = state
        .presence
        .list_typing(&room_id)
        .await
        .unwrap_or_default();
    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
struct KickRequest {
    username: String,
}

#[derive(Serialize)]
struct KickedResponse {
    kicked: String,
}

/// POST /rooms/{id}/kick — evict all sessions of a participant (admin only)
async fn kick_user(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<KickRequest>,
) -> Result<Json<KickedResponse>> {
    if !user.is_admin() {
        return Err(ChatError::forbidden("admin role required"));
    }
    let hub = state
        .manager
        .get(&room_id)
        .await
        .ok_or_else(|| ChatError::not_found("room is not active"))?;
    hub.kick(&req.username)
        .await
        .map_err(|_| ChatError::unavailable("room is shutting down"))?;

    Ok(Json(KickedResponse {
        kicked: req.username,
    }))
}

#[derive(Debug, Deserialize)]
struct AnnounceRequest {
    message: String,
}

#[derive(Serialize)]
struct AnnouncedResponse {
    message: &'static str,
}

/// POST /rooms/{id}/announce — administrative broadcast (admin only)
async fn announce(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<AnnounceRequest>,
) -> Result<Json<AnnouncedResponse>> {
    if !user.is_admin() {
        return Err(ChatError::forbidden("admin role required"));
    }
    validate_body(&state, &req.message)?;

    let hub = state
        .manager
        .get(&room_id)
        .await
        .ok_or_else(|| ChatError::not_found("room is not active"))?;
    let event = ChatEvent::announce(&room_id, &user.username, &escape_body(&req.message));
    hub.broadcast(event)
        .await
        .map_err(|_| ChatError::unavailable("room is shutting down"))?;

    Ok(Json(AnnouncedResponse {
        message: "announcement sent",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_from_header() {
        let req = request("/rooms/general/messages", Some("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_token_from_query() {
        let req = request("/rooms/general/ws?token=abc.def.ghi", None);
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def.ghi"));

        let req = request("/rooms/general/ws?foo=1&token=xyz", None);
        assert_eq!(bearer_token(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_bearer_token_missing() {
        let req = request("/rooms/general/messages", None);
        assert!(bearer_token(&req).is_none());

        let req = request("/rooms/general/messages", Some("Basic dXNlcjpwdw=="));
        assert!(bearer_token(&req).is_none());
    }
}
