use super::{ChatStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    Chat, ChatCursor, ChatPage, Message, MessageRole, MessageState, UpdateChatRequest,
    WorkParameters, Worker,
};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

// Recorded for moderation review; only tests read them back.
#[cfg_attr(not(test), allow(dead_code))]
struct StoredReport {
    id: Uuid,
    message_id: Uuid,
    report_type: String,
    reason: String,
}

#[derive(Default)]
struct Inner {
    chats: HashMap<Uuid, Chat>,
    messages: HashMap<Uuid, Message>,
    workers: Vec<Worker>,
    reports: Vec<StoredReport>,
}

/// In-memory store with the same semantics as `PgChatStore`.
#[derive(Default)]
pub struct LocalChatStore {
    inner: RwLock<Inner>,
}

impl LocalChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn touch_chat(inner: &mut Inner, chat_id: Uuid, tail: Option<Uuid>) {
    if let Some(chat) = inner.chats.get_mut(&chat_id) {
        chat.modified_at = Utc::now();
        if let Some(tail) = tail {
            chat.active_thread_tail_message_id = Some(tail);
        }
    }
}

#[async_trait]
impl ChatStore for LocalChatStore {
    async fn create_chat(&self, user_id: &str) -> StoreResult<Chat> {
        let chat = Chat::new(user_id);
        let mut inner = self.inner.write().unwrap();
        inner.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let inner = self.inner.read().unwrap();
        inner
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
    }

    async fn list_chats(
        &self,
        user_id: &str,
        cursor: Option<ChatCursor>,
        limit: usize,
        include_hidden: bool,
    ) -> StoreResult<ChatPage> {
        let inner = self.inner.read().unwrap();
        let mut chats: Vec<Chat> = inner
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .filter(|c| include_hidden || !c.hidden)
            .cloned()
            .collect();
        chats.sort_by(|a, b| (b.modified_at, b.id).cmp(&(a.modified_at, a.id)));
        if let Some(cursor) = cursor {
            chats.retain(|c| (c.modified_at, c.id) < (cursor.modified_at, cursor.id));
        }
        let next_cursor = if chats.len() > limit {
            chats.truncate(limit);
            chats.last().map(|c| {
                ChatCursor {
                    modified_at: c.modified_at,
                    id: c.id,
                }
                .encode()
            })
        } else {
            None
        };
        Ok(ChatPage { chats, next_cursor })
    }

    async fn update_chat(&self, chat_id: Uuid, update: UpdateChatRequest) -> StoreResult<Chat> {
        let mut inner = self.inner.write().unwrap();
        let chat = inner
            .chats
            .get_mut(&chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        if let Some(title) = update.title {
            chat.title = Some(title);
        }
        if let Some(hidden) = update.hidden {
            chat.hidden = hidden;
        }
        if let Some(allow) = update.allow_data_use {
            chat.allow_data_use = allow;
        }
        if let Some(tail) = update.active_thread_tail_message_id {
            chat.active_thread_tail_message_id = Some(tail);
        }
        chat.modified_at = Utc::now();
        Ok(chat.clone())
    }

    async fn add_prompter_message(
        &self,
        chat_id: Uuid,
        parent_id: Option<Uuid>,
        content: &str,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let chat = inner
            .chats
            .get(&chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        if chat.hidden {
            return Err(StoreError::ChatClosed(chat_id));
        }
        if let Some(parent_id) = parent_id {
            let parent = inner
                .messages
                .get(&parent_id)
                .ok_or_else(|| StoreError::InvalidParent(format!("message {parent_id}")))?;
            if parent.chat_id != chat_id {
                return Err(StoreError::InvalidParent(format!(
                    "message {parent_id} belongs to another chat"
                )));
            }
            if parent.role != MessageRole::Assistant {
                return Err(StoreError::RoleConflict(format!(
                    "a prompter message must reply to an assistant message, not {}",
                    parent.role.as_str()
                )));
            }
        }
        let message = Message::new_prompter(chat_id, parent_id, content);
        inner.messages.insert(message.id, message.clone());
        touch_chat(&mut inner, chat_id, Some(message.id));
        Ok(message)
    }

    async fn initiate_assistant_message(
        &self,
        parent_id: Uuid,
        work_parameters: WorkParameters,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let parent = inner
            .messages
            .get(&parent_id)
            .ok_or_else(|| StoreError::InvalidParent(format!("message {parent_id}")))?;
        if parent.role != MessageRole::Prompter {
            return Err(StoreError::RoleConflict(format!(
                "an assistant message must reply to a prompter message, not {}",
                parent.role.as_str()
            )));
        }
        if parent.state.is_failure() {
            return Err(StoreError::InvalidParent(format!(
                "parent {parent_id} is in failed state {}",
                parent.state.as_str()
            )));
        }
        let chat_id = parent.chat_id;
        if inner.chats.get(&chat_id).is_none_or(|c| c.hidden) {
            return Err(StoreError::ChatClosed(chat_id));
        }
        let message = Message::new_assistant(chat_id, parent_id, work_parameters);
        inner.messages.insert(message.id, message.clone());
        touch_chat(&mut inner, chat_id, Some(message.id));
        Ok(message)
    }

    async fn append_content(
        &self,
        message_id: Uuid,
        worker_id: Uuid,
        text: &str,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        match message.state {
            MessageState::Pending => {
                message.state = MessageState::InProgress;
                message.worker_id = Some(worker_id);
            }
            MessageState::InProgress => {
                if message.worker_id != Some(worker_id) {
                    return Err(StoreError::ConcurrencyViolation(message_id));
                }
            }
            from => {
                return Err(StoreError::InvalidTransition {
                    message_id,
                    from,
                    to: MessageState::InProgress,
                });
            }
        }
        message.content.push_str(text);
        let (chat_id, message) = (message.chat_id, message.clone());
        touch_chat(&mut inner, chat_id, None);
        Ok(message)
    }

    async fn finalize_message(
        &self,
        message_id: Uuid,
        state: MessageState,
        error: Option<&str>,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if message.state.is_terminal() {
            if message.state == state {
                return Ok(message.clone());
            }
            return Err(StoreError::AlreadyFinalized {
                message_id,
                state: message.state,
            });
        }
        if !state.is_terminal() || !message.state.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                message_id,
                from: message.state,
                to: state,
            });
        }
        if state == MessageState::Complete && message.content.is_empty() {
            return Err(StoreError::InvalidTransition {
                message_id,
                from: message.state,
                to: state,
            });
        }
        message.state = state;
        if state.is_failure() {
            message.error = Some(error.unwrap_or(state.as_str()).to_string());
        }
        let (chat_id, message) = (message.chat_id, message.clone());
        touch_chat(&mut inner, chat_id, None);
        Ok(message)
    }

    async fn release_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        match message.state {
            MessageState::Pending => Ok(message.clone()),
            MessageState::InProgress if message.content.is_empty() => {
                message.state = MessageState::Pending;
                message.worker_id = None;
                Ok(message.clone())
            }
            from => Err(StoreError::InvalidTransition {
                message_id,
                from,
                to: MessageState::Pending,
            }),
        }
    }

    async fn mark_safety_review(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut inner = self.inner.write().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if !message
            .state
            .can_transition_to(MessageState::PendingSafetyReview)
        {
            return Err(StoreError::InvalidTransition {
                message_id,
                from: message.state,
                to: MessageState::PendingSafetyReview,
            });
        }
        message.state = MessageState::PendingSafetyReview;
        Ok(message.clone())
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let inner = self.inner.read().unwrap();
        inner
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn get_thread(&self, message_id: Uuid) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().unwrap();
        let mut thread = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(message_id);
        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(StoreError::InvalidParent(format!(
                    "parent cycle through message {id}"
                )));
            }
            let message = inner
                .messages
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
            current = message.parent_id;
            thread.push(message.clone());
        }
        thread.reverse();
        Ok(thread)
    }

    async fn has_active_child(&self, parent_id: Uuid) -> StoreResult<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.messages.values().any(|m| {
            m.parent_id == Some(parent_id)
                && matches!(
                    m.state,
                    MessageState::Pending
                        | MessageState::InProgress
                        | MessageState::PendingSafetyReview
                )
        }))
    }

    async fn vote(&self, message_id: Uuid, score: i32) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.score = score;
        Ok(())
    }

    async fn add_report(
        &self,
        message_id: Uuid,
        report_type: &str,
        reason: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        inner.reports.push(StoredReport {
            id: Uuid::new_v4(),
            message_id,
            report_type: report_type.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn create_worker(&self, api_key: &str, name: &str) -> StoreResult<Worker> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.workers.iter().find(|w| w.api_key == api_key) {
            return Ok(existing.clone());
        }
        let worker = Worker::new(api_key, name);
        inner.workers.push(worker.clone());
        Ok(worker)
    }

    async fn find_worker_by_api_key(&self, api_key: &str) -> StoreResult<Option<Worker>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.workers.iter().find(|w| w.api_key == api_key).cloned())
    }

    async fn set_worker_compliance(
        &self,
        worker_id: Uuid,
        in_check: bool,
        next_check: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let worker = inner
            .workers
            .iter_mut()
            .find(|w| w.id == worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        worker.in_compliance_check = in_check;
        worker.next_compliance_check = next_check;
        Ok(())
    }

    async fn set_worker_trusted(&self, worker_id: Uuid, trusted: bool) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let worker = inner
            .workers
            .iter_mut()
            .find(|w| w.id == worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        worker.trusted = trusted;
        Ok(())
    }

    async fn workers_due_compliance(&self, now: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .workers
            .iter()
            .filter(|w| !w.in_compliance_check)
            .filter(|w| w.next_compliance_check.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (LocalChatStore, Chat, Message) {
        let store = LocalChatStore::new();
        let chat = store.create_chat("u1").await.unwrap();
        let prompter = store
            .add_prompter_message(chat.id, None, "Hello")
            .await
            .unwrap();
        (store, chat, prompter)
    }

    #[tokio::test]
    async fn roles_alternate_along_a_thread() {
        let (store, chat, prompter) = seeded().await;
        // prompter -> prompter is rejected
        let err = store
            .add_prompter_message(chat.id, Some(prompter.id), "again")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RoleConflict(_)));

        let assistant = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        // assistant -> assistant is rejected
        let err = store
            .initiate_assistant_message(assistant.id, WorkParameters::for_model("m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RoleConflict(_)));

        // prompter reply to the assistant is fine
        store
            .add_prompter_message(chat.id, Some(assistant.id), "and?")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prompter_message_rejects_foreign_and_missing_parents() {
        let (store, chat, _) = seeded().await;
        let other = store.create_chat("u1").await.unwrap();
        let foreign = store
            .add_prompter_message(other.id, None, "elsewhere")
            .await
            .unwrap();
        let err = store
            .add_prompter_message(chat.id, Some(foreign.id), "cross")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidParent(_)));

        let err = store
            .add_prompter_message(chat.id, Some(Uuid::now_v7()), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidParent(_)));
    }

    #[tokio::test]
    async fn hidden_chat_is_closed_to_new_messages() {
        let (store, chat, _) = seeded().await;
        store
            .update_chat(
                chat.id,
                UpdateChatRequest {
                    hidden: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = store
            .add_prompter_message(chat.id, None, "knock knock")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ChatClosed(_)));
    }

    #[tokio::test]
    async fn first_append_transitions_to_in_progress() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        let worker_id = Uuid::new_v4();
        let updated = store.append_content(msg.id, worker_id, "Hi").await.unwrap();
        assert_eq!(updated.state, MessageState::InProgress);
        assert_eq!(updated.worker_id, Some(worker_id));
        let updated = store
            .append_content(msg.id, worker_id, " there")
            .await
            .unwrap();
        assert_eq!(updated.content, "Hi there");
    }

    #[tokio::test]
    async fn second_writer_is_a_concurrency_violation() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        store
            .append_content(msg.id, Uuid::new_v4(), "Hi")
            .await
            .unwrap();
        let err = store
            .append_content(msg.id, Uuid::new_v4(), "mine now")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyViolation(_)));
    }

    #[tokio::test]
    async fn finalize_is_idempotent_per_terminal_state() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        let worker_id = Uuid::new_v4();
        store.append_content(msg.id, worker_id, "Hi").await.unwrap();
        store
            .finalize_message(msg.id, MessageState::Complete, None)
            .await
            .unwrap();
        // same terminal state: no-op
        let again = store
            .finalize_message(msg.id, MessageState::Complete, None)
            .await
            .unwrap();
        assert_eq!(again.state, MessageState::Complete);
        // different terminal state: rejected
        let err = store
            .finalize_message(msg.id, MessageState::Timeout, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized { .. }));
        // content is frozen
        let err = store
            .append_content(msg.id, worker_id, "more")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn complete_requires_content() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        store
            .append_content(msg.id, Uuid::new_v4(), "")
            .await
            .unwrap();
        let err = store
            .finalize_message(msg.id, MessageState::Complete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn failure_states_record_an_error_code() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        let finalized = store
            .finalize_message(msg.id, MessageState::Timeout, None)
            .await
            .unwrap();
        assert_eq!(finalized.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn release_requires_empty_content() {
        let (store, _, prompter) = seeded().await;
        let msg = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        let worker_id = Uuid::new_v4();
        store.append_content(msg.id, worker_id, "Hi").await.unwrap();
        let err = store.release_message(msg.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let fresh = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        let released = store.release_message(fresh.id).await.unwrap();
        assert_eq!(released.state, MessageState::Pending);
    }

    #[tokio::test]
    async fn thread_walk_returns_root_to_leaf() {
        let (store, chat, prompter) = seeded().await;
        let assistant = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        store
            .append_content(assistant.id, Uuid::new_v4(), "Hi")
            .await
            .unwrap();
        store
            .finalize_message(assistant.id, MessageState::Complete, None)
            .await
            .unwrap();
        let followup = store
            .add_prompter_message(chat.id, Some(assistant.id), "more?")
            .await
            .unwrap();

        let thread = store.get_thread(followup.id).await.unwrap();
        let ids: Vec<Uuid> = thread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![prompter.id, assistant.id, followup.id]);
        let roles: Vec<MessageRole> = thread.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::Prompter,
                MessageRole::Assistant,
                MessageRole::Prompter
            ]
        );
    }

    #[tokio::test]
    async fn thread_walk_rejects_parent_cycles() {
        let (store, _, prompter) = seeded().await;
        let assistant = store
            .initiate_assistant_message(prompter.id, WorkParameters::for_model("m1"))
            .await
            .unwrap();
        {
            let mut inner = store.inner.write().unwrap();
            let root = inner.messages.get_mut(&prompter.id).unwrap();
            root.parent_id = Some(assistant.id);
        }
        let err = store.get_thread(assistant.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidParent(_)));
    }

    #[tokio::test]
    async fn reports_record_their_subject_and_reason() {
        let (store, _, prompter) = seeded().await;
        store
            .add_report(prompter.id, "abuse", "contains personal data")
            .await
            .unwrap();

        let inner = store.inner.read().unwrap();
        let report = inner.reports.last().unwrap();
        assert!(!report.id.is_nil());
        assert_eq!(report.message_id, prompter.id);
        assert_eq!(report.report_type, "abuse");
        assert_eq!(report.reason, "contains personal data");
    }

    #[tokio::test]
    async fn list_chats_paginates_by_keyset() {
        let store = LocalChatStore::new();
        for _ in 0..5 {
            store.create_chat("u1").await.unwrap();
        }
        store.create_chat("u2").await.unwrap();

        let first = store.list_chats("u1", None, 2, false).await.unwrap();
        assert_eq!(first.chats.len(), 2);
        let cursor = ChatCursor::decode(first.next_cursor.as_deref().unwrap()).unwrap();
        let second = store
            .list_chats("u1", Some(cursor), 2, false)
            .await
            .unwrap();
        assert_eq!(second.chats.len(), 2);
        // no overlap, newest first
        for a in &first.chats {
            assert!(second.chats.iter().all(|b| b.id != a.id));
        }
        let cursor = ChatCursor::decode(second.next_cursor.as_deref().unwrap()).unwrap();
        let third = store
            .list_chats("u1", Some(cursor), 2, false)
            .await
            .unwrap();
        assert_eq!(third.chats.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn hidden_chats_are_filtered_unless_requested() {
        let store = LocalChatStore::new();
        let chat = store.create_chat("u1").await.unwrap();
        store
            .update_chat(
                chat.id,
                UpdateChatRequest {
                    hidden: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(
            store
                .list_chats("u1", None, 10, false)
                .await
                .unwrap()
                .chats
                .is_empty()
        );
        assert_eq!(
            store.list_chats("u1", None, 10, true).await.unwrap().chats.len(),
            1
        );
    }

    #[tokio::test]
    async fn compliance_due_listing() {
        let store = LocalChatStore::new();
        let worker = store.create_worker("key", "w1").await.unwrap();
        // fresh workers are due right away
        assert_eq!(
            store.workers_due_compliance(Utc::now()).await.unwrap().len(),
            1
        );
        store
            .set_worker_compliance(worker.id, false, Some(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(
            store
                .workers_due_compliance(Utc::now())
                .await
                .unwrap()
                .is_empty()
        );
        store
            .set_worker_compliance(worker.id, false, Some(Utc::now() - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        let due = store.workers_due_compliance(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        // already in a check: not listed again
        store
            .set_worker_compliance(worker.id, true, Some(Utc::now() - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        assert!(
            store
                .workers_due_compliance(Utc::now())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
