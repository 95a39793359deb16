use super::AuthedUser;
use crate::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shared::models::{Chat, ChatCursor, ChatPage, UpdateChatRequest};
use uuid::Uuid;

/// Loads a chat and enforces ownership. Foreign chats 404 rather than 403
/// so ids are not enumerable.
pub(super) async fn owned_chat(
    state: &AppState,
    user_id: &str,
    chat_id: Uuid,
) -> Result<Chat, ApiError> {
    let chat = state.store.get_chat(chat_id).await?;
    if chat.user_id != user_id {
        return Err(ApiError::NotFound(format!("chat {chat_id}")));
    }
    Ok(chat)
}

pub async fn create_chat(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<Chat>, ApiError> {
    let chat = state.store.create_chat(&user_id).await?;
    tracing::info!("created chat {} for user {user_id}", chat.id);
    Ok(Json(chat))
}

#[derive(Deserialize)]
pub struct ListChatsQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_hidden: bool,
}

pub async fn list_chats(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<ChatPage>, ApiError> {
    let cursor = match query.cursor.as_deref() {
        Some(raw) => Some(
            ChatCursor::decode(raw)
                .ok_or_else(|| ApiError::InvalidRequest("malformed cursor".into()))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page = state
        .store
        .list_chats(&user_id, cursor, limit, query.include_hidden)
        .await?;
    Ok(Json(page))
}

pub async fn get_chat(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Chat>, ApiError> {
    let chat = owned_chat(&state, &user_id, chat_id).await?;
    Ok(Json(chat))
}

pub async fn update_chat(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(chat_id): Path<Uuid>,
    Json(update): Json<UpdateChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    owned_chat(&state, &user_id, chat_id).await?;
    let chat = state.store.update_chat(chat_id, update).await?;
    Ok(Json(chat))
}
