//! HTTP route handlers for the chat ledger API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::controller::{SessionView, SettingsUpdate, SettingsView, TurnReply};
use crate::gateway::KeyUsage;
use crate::ledger::core::document::{Chat, Folder, SavedPrompt};
use crate::ledger::core::ids::{ChatId, FolderId, PromptId};
use crate::ledger::core::message::Message;
use crate::ledger::pricing::ModelSummary;

use super::error::ApiResult;
use super::state::AppState;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let static_files = ServeDir::new(&state.static_dir);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/folders", get(list_folders).post(create_folder))
        .route(
            "/api/folders/{id}",
            axum::routing::patch(rename_folder).delete(delete_folder),
        )
        .route("/api/folders/{id}/chats", post(create_chat))
        .route(
            "/api/chats/{id}",
            get(get_chat).patch(rename_chat).delete(delete_chat),
        )
        .route("/api/chats/{id}/move", post(move_chat))
        .route("/api/chats/{id}/select", post(select_chat))
        .route("/api/chats/{id}/messages", post(send_message))
        .route("/api/chats/{id}/clear-context", post(clear_context))
        .route("/api/regenerate", post(regenerate))
        .route("/api/session", get(session))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/keys", post(add_key))
        .route("/api/keys/select", post(select_key))
        .route("/api/keys/{name}", axum::routing::delete(remove_key))
        .route("/api/prompts", get(list_prompts).post(create_prompt))
        .route("/api/prompts/{id}", put(update_prompt).delete(delete_prompt))
        .route("/api/prompts/{id}/duplicate", post(duplicate_prompt))
        .route("/api/prompts/{id}/apply", post(apply_prompt))
        .route("/api/models", get(list_models))
        .route("/api/usage", get(key_usage))
        .route("/api/export", get(export_document))
        .route("/api/import", post(import_document))
        .fallback_service(static_files)
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-ledger",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ===== Folders ==============================================================

/// Folder name payload.
#[derive(Debug, Deserialize)]
pub struct FolderRequest {
    /// Folder name.
    pub name: String,
}

/// Result of a folder deletion.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedFolder {
    /// Chats removed with the folder.
    pub removed_chats: Vec<ChatId>,
}

async fn list_folders(State(state): State<Arc<AppState>>) -> Json<Vec<Folder>> {
    Json(state.controller.folders().await)
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FolderRequest>,
) -> ApiResult<(StatusCode, Json<Folder>)> {
    let folder = state.controller.create_folder(&request.name).await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

async fn rename_folder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FolderId>,
    Json(request): Json<FolderRequest>,
) -> ApiResult<StatusCode> {
    state.controller.rename_folder(&id, &request.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_folder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FolderId>,
) -> ApiResult<Json<DeletedFolder>> {
    let removed_chats = state.controller.delete_folder(&id).await?;
    Ok(Json(DeletedFolder { removed_chats }))
}

// ===== Chats ================================================================

/// Chat title payload.
#[derive(Debug, Deserialize)]
pub struct RenameChatRequest {
    /// New title.
    pub title: String,
}

/// Chat move payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveChatRequest {
    /// Destination folder.
    pub folder_id: FolderId,
}

/// User message payload.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Message text.
    pub content: String,
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FolderId>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let chat = state.controller.new_chat(&id).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(state.controller.chat(&id).await?))
}

async fn rename_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
    Json(request): Json<RenameChatRequest>,
) -> ApiResult<StatusCode> {
    state.controller.rename_chat(&id, &request.title).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.controller.delete_chat(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
    Json(request): Json<MoveChatRequest>,
) -> ApiResult<StatusCode> {
    state.controller.move_chat(&id, &request.folder_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn select_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
) -> ApiResult<Json<SessionView>> {
    state.controller.select_chat(&id).await?;
    Ok(Json(state.controller.session().await))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
    Json(request): Json<SendRequest>,
) -> ApiResult<Json<TurnReply>> {
    Ok(Json(
        state.controller.send_to_chat(&id, &request.content).await?,
    ))
}

async fn clear_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.controller.clear_context(Some(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn regenerate(State(state): State<Arc<AppState>>) -> ApiResult<Json<Message>> {
    Ok(Json(state.controller.regenerate().await?))
}

async fn session(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(state.controller.session().await)
}

// ===== Settings and keys ====================================================

/// API key registration payload.
#[derive(Debug, Deserialize)]
pub struct AddKeyRequest {
    /// Display name.
    pub name: String,
    /// Secret key value.
    pub key: String,
}

/// API key selection payload.
#[derive(Debug, Deserialize)]
pub struct SelectKeyRequest {
    /// Name of a registered key.
    pub name: String,
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsView> {
    Json(state.controller.settings().await)
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<SettingsView>> {
    Ok(Json(state.controller.update_settings(update).await?))
}

async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeyRequest>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .add_api_key(&request.name, &request.key)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn remove_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.controller.remove_api_key(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn select_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectKeyRequest>,
) -> ApiResult<StatusCode> {
    state.controller.select_api_key(&request.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelSummary>> {
    Json(state.controller.models())
}

async fn key_usage(State(state): State<Arc<AppState>>) -> ApiResult<Json<KeyUsage>> {
    Ok(Json(state.controller.key_usage().await?))
}

// ===== Prompts ==============================================================

/// Prompt search parameters.
#[derive(Debug, Deserialize)]
pub struct PromptQuery {
    /// Case-insensitive name filter.
    pub q: Option<String>,
}

/// Prompt template payload.
#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    /// Display name.
    pub name: String,
    /// Instruction text.
    pub content: String,
}

async fn list_prompts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PromptQuery>,
) -> Json<Vec<SavedPrompt>> {
    Json(state.controller.prompts(query.q.as_deref()).await)
}

async fn create_prompt(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<(StatusCode, Json<SavedPrompt>)> {
    let prompt = state
        .controller
        .create_prompt(&request.name, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

async fn update_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PromptId>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<Json<SavedPrompt>> {
    Ok(Json(
        state
            .controller
            .update_prompt(&id, &request.name, &request.content)
            .await?,
    ))
}

async fn delete_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PromptId>,
) -> ApiResult<Json<SavedPrompt>> {
    Ok(Json(state.controller.delete_prompt(&id).await?))
}

async fn duplicate_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PromptId>,
) -> ApiResult<(StatusCode, Json<SavedPrompt>)> {
    let copy = state.controller.duplicate_prompt(&id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn apply_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PromptId>,
) -> ApiResult<Json<SavedPrompt>> {
    Ok(Json(state.controller.apply_prompt(&id).await?))
}

// ===== Export / import ======================================================

async fn export_document(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.controller.export().await?))
}

async fn import_document(
    State(state): State<Arc<AppState>>,
    Json(document): Json<serde_json::Value>,
) -> ApiResult<StatusCode> {
    state.controller.import(document).await?;
    Ok(StatusCode::NO_CONTENT)
}
