//! Persistent record of chats, messages, and workers. The trait is the
//! storage seam; `PgChatStore` is the production implementation and
//! `LocalChatStore` the in-memory twin used by tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    Chat, ChatCursor, ChatPage, Message, MessageState, UpdateChatRequest, WorkParameters, Worker,
};
use thiserror::Error;
use uuid::Uuid;

pub mod local;
pub mod postgres;

pub use local::LocalChatStore;
pub use postgres::PgChatStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("invalid parent: {0}")]
    InvalidParent(String),
    #[error("role conflict: {0}")]
    RoleConflict(String),
    #[error("chat {0} is closed")]
    ChatClosed(Uuid),
    #[error("message {message_id} already finalized as {}", state.as_str())]
    AlreadyFinalized { message_id: Uuid, state: MessageState },
    #[error("message {message_id}: invalid transition {} -> {}", from.as_str(), to.as_str())]
    InvalidTransition {
        message_id: Uuid,
        from: MessageState,
        to: MessageState,
    },
    /// A second writer appeared on an in-progress message. Invariant breach,
    /// not a recoverable error.
    #[error("concurrent writer on message {0}")]
    ConcurrencyViolation(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, user_id: &str) -> StoreResult<Chat>;
    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat>;
    /// Keyset pagination by `(modified_at, id)` descending.
    async fn list_chats(
        &self,
        user_id: &str,
        cursor: Option<ChatCursor>,
        limit: usize,
        include_hidden: bool,
    ) -> StoreResult<ChatPage>;
    /// Mutates only title, hidden, allow_data_use, and the active tail.
    async fn update_chat(&self, chat_id: Uuid, update: UpdateChatRequest) -> StoreResult<Chat>;

    async fn add_prompter_message(
        &self,
        chat_id: Uuid,
        parent_id: Option<Uuid>,
        content: &str,
    ) -> StoreResult<Message>;
    /// Parent must be a prompter message in a non-failed state; the new
    /// assistant message is created `pending` with its compat hash recorded.
    async fn initiate_assistant_message(
        &self,
        parent_id: Uuid,
        work_parameters: WorkParameters,
    ) -> StoreResult<Message>;
    /// Appends token text; on first call transitions `pending ->
    /// in_progress` and records the worker id.
    async fn append_content(
        &self,
        message_id: Uuid,
        worker_id: Uuid,
        text: &str,
    ) -> StoreResult<Message>;
    /// Idempotent for the same terminal state; `AlreadyFinalized` otherwise.
    async fn finalize_message(
        &self,
        message_id: Uuid,
        state: MessageState,
        error: Option<&str>,
    ) -> StoreResult<Message>;
    /// Returns a content-less message to `pending` so another worker can
    /// pick it up (worker died before its first token).
    async fn release_message(&self, message_id: Uuid) -> StoreResult<Message>;
    async fn mark_safety_review(&self, message_id: Uuid) -> StoreResult<Message>;
    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message>;
    /// Root-to-message path in insertion order; rejects parent cycles.
    async fn get_thread(&self, message_id: Uuid) -> StoreResult<Vec<Message>>;
    /// Whether the parent already has a pending or in-progress reply.
    async fn has_active_child(&self, parent_id: Uuid) -> StoreResult<bool>;

    async fn vote(&self, message_id: Uuid, score: i32) -> StoreResult<()>;
    async fn add_report(
        &self,
        message_id: Uuid,
        report_type: &str,
        reason: &str,
    ) -> StoreResult<()>;

    async fn create_worker(&self, api_key: &str, name: &str) -> StoreResult<Worker>;
    async fn find_worker_by_api_key(&self, api_key: &str) -> StoreResult<Option<Worker>>;
    async fn set_worker_compliance(
        &self,
        worker_id: Uuid,
        in_check: bool,
        next_check: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    async fn set_worker_trusted(&self, worker_id: Uuid, trusted: bool) -> StoreResult<()>;
    async fn workers_due_compliance(&self, now: DateTime<Utc>) -> StoreResult<Vec<Worker>>;
}
