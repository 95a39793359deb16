use super::chats::owned_chat;
use super::AuthedUser;
use crate::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use shared::models::{
    CreateAssistantMessageRequest, CreatePrompterMessageRequest, Message, MessageRole,
    ReportRequest, VoteRequest, WorkParameters,
};
use uuid::Uuid;

/// Loads a message and enforces that it belongs to the addressed chat and
/// that the chat belongs to the caller.
async fn owned_message(
    state: &AppState,
    user_id: &str,
    chat_id: Uuid,
    message_id: Uuid,
) -> Result<Message, ApiError> {
    owned_chat(state, user_id, chat_id).await?;
    let message = state.store.get_message(message_id).await?;
    if message.chat_id != chat_id {
        return Err(ApiError::NotFound(format!("message {message_id}")));
    }
    Ok(message)
}

/// Event streams only exist for assistant messages; anything else 404s.
pub(super) async fn owned_assistant_message(
    state: &AppState,
    user_id: &str,
    chat_id: Uuid,
    message_id: Uuid,
) -> Result<Message, ApiError> {
    let message = owned_message(state, user_id, chat_id, message_id).await?;
    if message.role != MessageRole::Assistant {
        return Err(ApiError::NotFound(format!("message {message_id}")));
    }
    Ok(message)
}

pub async fn create_prompter_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(chat_id): Path<Uuid>,
    Json(request): Json<CreatePrompterMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    owned_chat(&state, &user_id, chat_id).await?;
    if request.content.trim().is_empty() {
        return Err(ApiError::InvalidRequest("content must not be empty".into()));
    }
    let message = state
        .store
        .add_prompter_message(chat_id, request.parent_id, &request.content)
        .await?;
    Ok(Json(message))
}

pub async fn create_assistant_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(chat_id): Path<Uuid>,
    Json(request): Json<CreateAssistantMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    owned_chat(&state, &user_id, chat_id).await?;

    if !state
        .config
        .allowed_model_configs
        .allows(&request.model_config_name)
    {
        return Err(ApiError::ModelNotAllowed(request.model_config_name));
    }

    let mut parameters = WorkParameters::for_model(&request.model_config_name);
    if let Some(sampling) = request.sampling_parameters {
        parameters.sampling = sampling;
    }
    parameters.system_prompt = request.system_prompt;
    parameters.user_profile = request.user_profile;
    parameters.plugins = request.plugins;

    let compat_hash = parameters.compat_hash();
    if !state.config.allowed_compat_hashes.allows(&compat_hash) {
        return Err(ApiError::ModelNotAllowed(request.model_config_name));
    }

    // One generation at a time per prompter message.
    if state.store.has_active_child(request.parent_id).await? {
        return Err(ApiError::RateLimited(format!(
            "message {} already has an active reply",
            request.parent_id
        )));
    }

    let parent = state.store.get_message(request.parent_id).await?;
    if parent.chat_id != chat_id {
        return Err(ApiError::NotFound(format!("message {}", request.parent_id)));
    }

    let message = state
        .store
        .initiate_assistant_message(request.parent_id, parameters)
        .await?;
    state.coordinator.enqueue_assistant(&message).await?;
    tracing::info!(
        "enqueued assistant message {} on hash {compat_hash}",
        message.id
    );
    Ok(Json(message))
}

pub async fn get_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Message>, ApiError> {
    let message = owned_message(&state, &user_id, chat_id, message_id).await?;
    Ok(Json(message))
}

pub async fn cancel_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let message = owned_message(&state, &user_id, chat_id, message_id).await?;
    state.coordinator.request_cancel(&message).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn vote_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<VoteRequest>,
) -> Result<StatusCode, ApiError> {
    if !(-1..=1).contains(&request.score) {
        return Err(ApiError::InvalidRequest("score must be -1, 0, or 1".into()));
    }
    owned_message(&state, &user_id, chat_id, message_id).await?;
    state.store.vote(message_id, request.score).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_message(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ReportRequest>,
) -> Result<StatusCode, ApiError> {
    if request.reason.trim().is_empty() {
        return Err(ApiError::InvalidRequest("reason must not be empty".into()));
    }
    owned_message(&state, &user_id, chat_id, message_id).await?;
    state
        .store
        .add_report(message_id, &request.report_type, &request.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
