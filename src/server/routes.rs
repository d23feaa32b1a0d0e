//! HTTP route handlers for the chat API.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::chat::types::iso_millis;
use crate::chat::{
    ChatError, ChatResult, ChatStore, Conversation, DisplayMessage, LiveGeneration, Message,
    SendOutcome,
};
use crate::llm::{GenerationOptions, InferenceError, ModelInfo};

use super::state::AppState;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            put(rename_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/activate", post(activate_conversation))
        .route("/api/messages", get(list_messages).post(send_message))
        .route("/api/messages/retry", post(retry_message))
        .route("/api/messages/clear", post(clear_messages))
        .route("/api/messages/{id}", put(edit_message).delete(delete_message))
        .route("/api/generation", get(generation_state))
        .route("/api/generation/stop", post(stop_generation))
        .route("/api/search", get(search_messages))
        .route("/api/export", get(export_conversation))
        .route("/api/models", get(list_models))
        .route("/api/connection/check", post(check_connection))
        .fallback_service(ServeDir::new("static"))
        .with_state(state)
}

// ===== Errors ===============================================================

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

/// Handler error mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    const fn internal(message: String) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::EmptyContent
            | ChatError::NoUserMessage
            | ChatError::InvalidEditTarget
            | ChatError::UnsupportedFormat(_)
            | ChatError::Inference(InferenceError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            ChatError::MessageNotFound => StatusCode::NOT_FOUND,
            ChatError::NotReady(_) | ChatError::GenerationInProgress => StatusCode::CONFLICT,
            ChatError::EmptyResponse | ChatError::Inference(_) => StatusCode::BAD_GATEWAY,
            ChatError::Serialization(_) | ChatError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self(status, err.to_string())
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        ChatError::Inference(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            tracing::warn!("Request failed with {}: {}", self.0, self.1);
        }
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ===== Health ===============================================================

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ollama-chat",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": state.client.is_connected()
    }))
}

// ===== Conversations ========================================================

/// Conversation list entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: String,
    /// Title.
    pub title: String,
    /// Creation time.
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
    /// Number of persisted messages.
    pub message_count: usize,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.to_string(),
            title: c.title.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
            message_count: c.messages.len(),
        }
    }
}

/// Conversation list response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsResponse {
    /// All conversations, newest first.
    pub conversations: Vec<ConversationSummary>,
    /// Active conversation id.
    pub active_id: String,
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Json<ConversationsResponse> {
    let store = state.store.lock().await;
    Json(ConversationsResponse {
        conversations: store
            .conversations()
            .iter()
            .map(ConversationSummary::from)
            .collect(),
        active_id: store.active_conversation_id().to_string(),
    })
}

async fn create_conversation(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let id = state.store.lock().await.new_conversation();
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id })))
}

async fn activate_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.lock().await.set_active_conversation(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Conversation"))
    }
}

/// Rename request.
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    /// New title; blank keeps the current one.
    pub title: String,
}

async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    if state.store.lock().await.rename_conversation(&id, &request.title) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Conversation"))
    }
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.lock().await.delete_conversation(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Conversation"))
    }
}

// ===== Messages =============================================================

/// Active conversation view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    /// Persisted messages plus the live reply.
    pub messages: Vec<DisplayMessage>,
    /// Whether a reply is being generated.
    pub is_generating: bool,
    /// Whether a message can be sent now.
    pub can_send: bool,
    /// Last failure text.
    pub last_error: Option<String>,
}

impl From<&ChatStore> for MessagesResponse {
    fn from(store: &ChatStore) -> Self {
        Self {
            messages: store.display_messages(),
            is_generating: store.is_generating(),
            can_send: store.can_send_message(),
            last_error: store.last_error().map(str::to_string),
        }
    }
}

/// The store stays locked while a reply streams; that view comes from the
/// monitor instead.
async fn list_messages(State(state): State<Arc<AppState>>) -> Json<MessagesResponse> {
    if let Ok(store) = state.store.try_lock() {
        return Json(MessagesResponse::from(&*store));
    }
    if let Some(messages) = state.monitor.display_messages(Utc::now()) {
        return Json(MessagesResponse {
            messages,
            is_generating: true,
            can_send: false,
            last_error: None,
        });
    }
    let store = state.store.lock().await;
    Json(MessagesResponse::from(&*store))
}

/// Send or edit request.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Message text.
    pub content: String,
    /// Sampling overrides.
    #[serde(default)]
    pub options: GenerationOptions,
}

/// Run a generating store call on its own task.
///
/// The request future is dropped when the client goes away; the spawned
/// task keeps streaming and commits the reply regardless.
async fn detached<T, F>(generation: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: Future<Output = ChatResult<T>> + Send + 'static,
{
    match tokio::spawn(generation).await {
        Ok(result) => Ok(Json(result?)),
        Err(e) => Err(ApiError::internal(format!("generation task failed: {e}"))),
    }
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendRequest>,
) -> ApiResult<SendOutcome> {
    detached(async move {
        let mut store = state.store.lock().await;
        store.send_message(&request.content, request.options).await
    })
    .await
}

async fn retry_message(State(state): State<Arc<AppState>>) -> ApiResult<SendOutcome> {
    detached(async move {
        let mut store = state.store.lock().await;
        store.retry_last_message(GenerationOptions::default()).await
    })
    .await
}

/// Edit response; `outcome` is absent when the edit only truncated.
#[derive(Debug, Serialize)]
pub struct EditResponse {
    /// Result of re-sending the edited turn.
    pub outcome: Option<SendOutcome>,
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult<EditResponse> {
    let Json(outcome) = detached(async move {
        let mut store = state.store.lock().await;
        store
            .edit_message(&id, &request.content, request.options)
            .await
    })
    .await?;
    Ok(Json(EditResponse { outcome }))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.lock().await.delete_message(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Message"))
    }
}

async fn clear_messages(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.store.lock().await.clear_conversation()?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== Generation ===========================================================

async fn generation_state(State(state): State<Arc<AppState>>) -> Json<LiveGeneration> {
    Json(state.monitor.snapshot())
}

async fn stop_generation(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "stopped": state.monitor.stop() }))
}

// ===== Search and export ====================================================

/// Search query string.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// Case-insensitive substring.
    #[serde(default)]
    pub q: String,
}

async fn search_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<Message>> {
    Json(state.store.lock().await.search_messages(&params.q))
}

/// Export query string.
#[derive(Debug, Deserialize)]
pub struct ExportParams {
    /// `json`, `txt` or `md`; defaults to `json`.
    pub format: Option<String>,
}

async fn export_conversation(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let format = params.format.as_deref().unwrap_or("json");
    let file = state.store.lock().await.export_conversation(format)?;
    let disposition = format!("attachment; filename=\"{}\"", file.filename);
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.data,
    )
        .into_response())
}

// ===== Ollama ===============================================================

async fn list_models(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ModelInfo>> {
    Ok(Json(state.client.list_models().await?))
}

/// Connection check result.
#[derive(Debug, Serialize)]
pub struct ConnectionStatus {
    /// Whether the server is reachable with the configured model.
    pub connected: bool,
    /// Failure text when not connected.
    pub error: Option<String>,
}

async fn check_connection(State(state): State<Arc<AppState>>) -> Json<ConnectionStatus> {
    let result = if let Ok(mut store) = state.store.try_lock() {
        store.check_connection().await
    } else {
        // Busy streaming a reply: ask the client directly.
        state.client.check_connection().await.map_err(ChatError::from)
    };
    Json(ConnectionStatus {
        connected: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
    })
}
