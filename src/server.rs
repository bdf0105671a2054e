//! HTTP surface used by the web frontend.
//!
//! Every response is JSON with a `success` flag and either a payload or an
//! `error` message.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::session::{ConnectionStatus, NotConnected, UserRegistry};
use crate::store::ChatSelection;

type AppState = Arc<UserRegistry>;
type ApiResult = Result<Json<Value>, ApiError>;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if e.downcast_ref::<NotConnected>().is_some() {
            return Self::bad_request(e.to_string());
        }
        error!("Request failed: {:#}", e);
        Self::internal(format!("{:#}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

fn ok(message: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": message }))
}

pub fn router(registry: Arc<UserRegistry>) -> Router {
    Router::new()
        .route("/qr/{user_id}", get(qr))
        .route("/start-listening/{user_id}", get(start_listening))
        .route(
            "/start-listening-deletions/{user_id}",
            get(start_listening_deletions),
        )
        .route("/sessions", get(sessions))
        .route("/check-session/{user_id}", get(check_session))
        .route("/restart-session/{user_id}", get(restart_session))
        .route("/chats/{user_id}", get(chats))
        .route("/save-chats/{user_id}", post(save_chats))
        .route("/get-user-bot/{user_id}", get(get_user_bot))
        .route("/get-telegram-chats/{user_id}", get(get_telegram_chats))
        .route(
            "/register-telegram-chat/{user_id}",
            post(register_telegram_chat),
        )
        .route("/save-telegram-chats/{user_id}", post(save_telegram_chats))
        .route("/suffix/{user_id}", post(set_suffix))
        .route("/status/{user_id}", get(relay_status))
        .with_state(registry)
}

async fn qr(State(registry): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let status = registry.request_qr(&user_id).await?;
    let body = match status.status {
        ConnectionStatus::Available => json!({
            "success": true,
            "status": status.status,
            "qr": status.qr,
        }),
        ConnectionStatus::Connected => json!({
            "success": true,
            "status": status.status,
            "message": "Already connected.",
        }),
        ConnectionStatus::Pending | ConnectionStatus::Disconnected => json!({
            "success": true,
            "status": ConnectionStatus::Pending,
            "message": "QR code not available yet. Try again.",
        }),
    };
    Ok(Json(body))
}

async fn start_listening(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    info!("Enabling message listening for {}", user_id);
    registry.start_listening(&user_id).await?;
    Ok(ok("Message forwarding enabled."))
}

async fn start_listening_deletions(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    info!("Enabling deletion listening for {}", user_id);
    registry.start_listening_deletions(&user_id).await?;
    Ok(ok("Message deletion tracking enabled."))
}

async fn sessions(State(registry): State<AppState>) -> ApiResult {
    let sessions = registry.sessions().await;
    Ok(Json(json!({ "success": true, "sessions": sessions })))
}

async fn check_session(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let active = registry.is_active(&user_id).await;
    Ok(Json(json!({ "success": true, "isActive": active })))
}

async fn restart_session(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    info!("Manual session restart requested for {}", user_id);
    registry.restart_session(&user_id, false).await;
    Ok(ok("Session restarted."))
}

async fn chats(State(registry): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let chats = registry.chats(&user_id).await?;
    Ok(Json(json!({ "success": true, "chats": chats })))
}

async fn save_chats(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
    Json(selection): Json<ChatSelection>,
) -> ApiResult {
    registry.save_chats(&user_id, &selection).await?;
    Ok(ok("Chat selections saved and message listening started."))
}

async fn get_user_bot(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    match registry.assign_bot(&user_id).await? {
        Some(assignment) => Ok(Json(json!({
            "success": true,
            "botName": assignment.bot_name,
            "botToken": assignment.bot_token,
        }))),
        None => Err(ApiError::internal("No Telegram bot available.")),
    }
}

async fn get_telegram_chats(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let chats = registry.store().secondary_chats(&user_id).await?;
    Ok(Json(json!({ "success": true, "chats": chats })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterChat {
    chat_id: i64,
    name: Option<String>,
}

/// Manual counterpart of the bot's chat discovery
async fn register_telegram_chat(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<RegisterChat>,
) -> ApiResult {
    let name = body.name.unwrap_or_else(|| body.chat_id.to_string());
    registry
        .store()
        .record_secondary_chat(&user_id, body.chat_id, &name)
        .await?;
    info!("Registered Telegram chat {} for {}", body.chat_id, user_id);
    Ok(ok("Telegram chat ID registered."))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectedChats {
    selected_chats: Vec<i64>,
}

async fn save_telegram_chats(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<SelectedChats>,
) -> ApiResult {
    registry
        .store()
        .select_secondary_chats(&user_id, &body.selected_chats)
        .await?;
    Ok(ok("Telegram target chats saved."))
}

#[derive(Deserialize)]
struct SuffixBody {
    suffix: String,
}

async fn set_suffix(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<SuffixBody>,
) -> ApiResult {
    registry.store().set_suffix(&user_id, &body.suffix).await?;
    Ok(ok("Suffix saved."))
}

async fn relay_status(
    State(registry): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult {
    match registry.relay_status(&user_id).await {
        Some(status) => Ok(Json(json!({ "success": true, "relay": status }))),
        None => Err(ApiError::bad_request("User is not listening.")),
    }
}
