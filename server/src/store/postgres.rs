use super::{ChatStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::models::{
    Chat, ChatCursor, ChatPage, Message, MessageRole, MessageState, UpdateChatRequest,
    WorkParameters, Worker,
};
use sqlx::{Pool, Postgres, Row, postgres::PgPoolOptions, postgres::PgRow};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgChatStore {
    pool: Pool<Postgres>,
}

const MESSAGE_COLUMNS: &str = "id, chat_id, parent_id, role, content, state, error, \
     work_parameters, worker_id, worker_compat_hash, score, inferior_ids, created_at";

impl PgChatStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chats (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                hidden BOOLEAN NOT NULL DEFAULT FALSE,
                allow_data_use BOOLEAN NOT NULL DEFAULT TRUE,
                active_thread_tail UUID,
                created_at TIMESTAMPTZ NOT NULL,
                modified_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                chat_id UUID NOT NULL REFERENCES chats(id),
                parent_id UUID,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                work_parameters JSONB,
                worker_id UUID,
                worker_compat_hash TEXT,
                score INTEGER NOT NULL DEFAULT 0,
                inferior_ids JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workers (
                id UUID PRIMARY KEY,
                api_key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                trusted BOOLEAN NOT NULL DEFAULT FALSE,
                in_compliance_check BOOLEAN NOT NULL DEFAULT FALSE,
                next_compliance_check TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reports (
                id UUID PRIMARY KEY,
                message_id UUID NOT NULL REFERENCES messages(id),
                report_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages (parent_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chats_user_modified
                ON chats (user_id, modified_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn chat_from_row(row: &PgRow) -> Chat {
    Chat {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        hidden: row.get("hidden"),
        allow_data_use: row.get("allow_data_use"),
        active_thread_tail_message_id: row.get("active_thread_tail"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    }
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    let id: Uuid = row.get("id");
    let role: String = row.get("role");
    let role = MessageRole::parse(&role)
        .ok_or_else(|| StoreError::Corrupt(format!("message {id} role {role:?}")))?;
    let state: String = row.get("state");
    let state = MessageState::parse(&state)
        .ok_or_else(|| StoreError::Corrupt(format!("message {id} state {state:?}")))?;
    let work_parameters: Option<WorkParameters> = match row.get::<Option<Value>, _>("work_parameters")
    {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    let inferior_ids: Vec<Uuid> = serde_json::from_value(row.get("inferior_ids"))?;
    Ok(Message {
        id,
        chat_id: row.get("chat_id"),
        parent_id: row.get("parent_id"),
        role,
        content: row.get("content"),
        state,
        error: row.get("error"),
        work_parameters,
        worker_id: row.get("worker_id"),
        worker_compat_hash: row.get("worker_compat_hash"),
        score: row.get("score"),
        inferior_ids,
        created_at: row.get("created_at"),
    })
}

fn worker_from_row(row: &PgRow) -> Worker {
    Worker {
        id: row.get("id"),
        api_key: row.get("api_key"),
        name: row.get("name"),
        trusted: row.get("trusted"),
        in_compliance_check: row.get("in_compliance_check"),
        next_compliance_check: row.get("next_compliance_check"),
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_chat(&self, user_id: &str) -> StoreResult<Chat> {
        let chat = Chat::new(user_id);
        sqlx::query(
            "INSERT INTO chats (id, user_id, hidden, allow_data_use, created_at, modified_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(chat.id)
        .bind(&chat.user_id)
        .bind(chat.hidden)
        .bind(chat.allow_data_use)
        .bind(chat.created_at)
        .bind(chat.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = $1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(chat_from_row(&row)),
            None => Err(StoreError::NotFound(format!("chat {chat_id}"))),
        }
    }

    async fn list_chats(
        &self,
        user_id: &str,
        cursor: Option<ChatCursor>,
        limit: usize,
        include_hidden: bool,
    ) -> StoreResult<ChatPage> {
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(
                    "SELECT * FROM chats
                     WHERE user_id = $1 AND (hidden = FALSE OR $2)
                       AND (modified_at, id) < ($3, $4)
                     ORDER BY modified_at DESC, id DESC
                     LIMIT $5",
                )
                .bind(user_id)
                .bind(include_hidden)
                .bind(cursor.modified_at)
                .bind(cursor.id)
                .bind(limit as i64 + 1)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM chats
                     WHERE user_id = $1 AND (hidden = FALSE OR $2)
                     ORDER BY modified_at DESC, id DESC
                     LIMIT $3",
                )
                .bind(user_id)
                .bind(include_hidden)
                .bind(limit as i64 + 1)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut chats: Vec<Chat> = rows.iter().map(chat_from_row).collect();
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
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM chats WHERE id = $1 FOR UPDATE")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let mut chat = chat_from_row(&row);
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
        sqlx::query(
            "UPDATE chats SET title = $1, hidden = $2, allow_data_use = $3,
                active_thread_tail = $4, modified_at = $5 WHERE id = $6",
        )
        .bind(&chat.title)
        .bind(chat.hidden)
        .bind(chat.allow_data_use)
        .bind(chat.active_thread_tail_message_id)
        .bind(chat.modified_at)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(chat)
    }

    async fn add_prompter_message(
        &self,
        chat_id: Uuid,
        parent_id: Option<Uuid>,
        content: &str,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let chat_row = sqlx::query("SELECT * FROM chats WHERE id = $1 FOR UPDATE")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        if chat_from_row(&chat_row).hidden {
            return Err(StoreError::ChatClosed(chat_id));
        }
        if let Some(parent_id) = parent_id {
            let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
            let parent_row = sqlx::query(&query)
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::InvalidParent(format!("message {parent_id}")))?;
            let parent = message_from_row(&parent_row)?;
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
        insert_message(&mut tx, &message).await?;
        touch_chat(&mut tx, chat_id, Some(message.id)).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn initiate_assistant_message(
        &self,
        parent_id: Uuid,
        work_parameters: WorkParameters,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE");
        let parent_row = sqlx::query(&query)
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::InvalidParent(format!("message {parent_id}")))?;
        let parent = message_from_row(&parent_row)?;
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
        let hidden: bool = sqlx::query("SELECT hidden FROM chats WHERE id = $1 FOR UPDATE")
            .bind(parent.chat_id)
            .fetch_one(&mut *tx)
            .await?
            .get("hidden");
        if hidden {
            return Err(StoreError::ChatClosed(parent.chat_id));
        }
        let message = Message::new_assistant(parent.chat_id, parent_id, work_parameters);
        insert_message(&mut tx, &message).await?;
        touch_chat(&mut tx, parent.chat_id, Some(message.id)).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn append_content(
        &self,
        message_id: Uuid,
        worker_id: Uuid,
        text: &str,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let mut message = lock_message(&mut tx, message_id).await?;
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
        sqlx::query(
            "UPDATE messages SET content = content || $1, state = $2, worker_id = $3
             WHERE id = $4",
        )
        .bind(text)
        .bind(message.state.as_str())
        .bind(message.worker_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        touch_chat(&mut tx, message.chat_id, None).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn finalize_message(
        &self,
        message_id: Uuid,
        state: MessageState,
        error: Option<&str>,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let mut message = lock_message(&mut tx, message_id).await?;
        if message.state.is_terminal() {
            if message.state == state {
                return Ok(message);
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
        sqlx::query("UPDATE messages SET state = $1, error = $2 WHERE id = $3")
            .bind(message.state.as_str())
            .bind(&message.error)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        touch_chat(&mut tx, message.chat_id, None).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn release_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let mut message = lock_message(&mut tx, message_id).await?;
        match message.state {
            MessageState::Pending => Ok(message),
            MessageState::InProgress if message.content.is_empty() => {
                message.state = MessageState::Pending;
                message.worker_id = None;
                sqlx::query("UPDATE messages SET state = $1, worker_id = NULL WHERE id = $2")
                    .bind(message.state.as_str())
                    .bind(message_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(message)
            }
            from => Err(StoreError::InvalidTransition {
                message_id,
                from,
                to: MessageState::Pending,
            }),
        }
    }

    async fn mark_safety_review(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let mut message = lock_message(&mut tx, message_id).await?;
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
        sqlx::query("UPDATE messages SET state = $1 WHERE id = $2")
            .bind(message.state.as_str())
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message_from_row(&row)
    }

    async fn get_thread(&self, message_id: Uuid) -> StoreResult<Vec<Message>> {
        // Recursive ancestor walk; the depth cap guards against parent
        // cycles, which the store otherwise never creates. Hitting the cap
        // means the walk never reached a root, so the chain is rejected the
        // same way the in-memory store rejects a cycle.
        let query = format!(
            "WITH RECURSIVE thread AS (
                SELECT m.*, 0 AS depth FROM messages m WHERE m.id = $1
                UNION ALL
                SELECT m.*, t.depth + 1 FROM messages m
                    JOIN thread t ON m.id = t.parent_id
                WHERE t.depth < 10000
            )
            SELECT {MESSAGE_COLUMNS}, depth FROM thread ORDER BY depth DESC"
        );
        let rows = sqlx::query(&query)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        if rows[0].get::<i32, _>("depth") >= 10000 {
            return Err(StoreError::InvalidParent(format!(
                "parent chain above message {message_id} has no root"
            )));
        }
        rows.iter().map(message_from_row).collect()
    }

    async fn has_active_child(&self, parent_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM messages
             WHERE parent_id = $1
               AND state IN ('pending', 'in_progress', 'pending_safety_review')",
        )
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn vote(&self, message_id: Uuid, score: i32) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET score = $1 WHERE id = $2")
            .bind(score)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn add_report(
        &self,
        message_id: Uuid,
        report_type: &str,
        reason: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO reports (id, message_id, report_type, reason, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(message_id)
        .bind(report_type)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                StoreError::NotFound(format!("message {message_id}"))
            }
            other => StoreError::Sqlx(other),
        })?;
        Ok(())
    }

    async fn create_worker(&self, api_key: &str, name: &str) -> StoreResult<Worker> {
        if let Some(existing) = self.find_worker_by_api_key(api_key).await? {
            return Ok(existing);
        }
        let worker = Worker::new(api_key, name);
        sqlx::query(
            "INSERT INTO workers (id, api_key, name, trusted, in_compliance_check, next_compliance_check)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (api_key) DO NOTHING",
        )
        .bind(worker.id)
        .bind(&worker.api_key)
        .bind(&worker.name)
        .bind(worker.trusted)
        .bind(worker.in_compliance_check)
        .bind(worker.next_compliance_check)
        .execute(&self.pool)
        .await?;
        Ok(worker)
    }

    async fn find_worker_by_api_key(&self, api_key: &str) -> StoreResult<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(worker_from_row))
    }

    async fn set_worker_compliance(
        &self,
        worker_id: Uuid,
        in_check: bool,
        next_check: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET in_compliance_check = $1, next_compliance_check = $2
             WHERE id = $3",
        )
        .bind(in_check)
        .bind(next_check)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn set_worker_trusted(&self, worker_id: Uuid, trusted: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE workers SET trusted = $1 WHERE id = $2")
            .bind(trusted)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn workers_due_compliance(&self, now: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers
             WHERE in_compliance_check = FALSE AND next_compliance_check <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(worker_from_row).collect())
    }
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    message: &Message,
) -> StoreResult<()> {
    let params = match &message.work_parameters {
        Some(p) => Some(serde_json::to_value(p)?),
        None => None,
    };
    sqlx::query(
        "INSERT INTO messages (id, chat_id, parent_id, role, content, state, error,
            work_parameters, worker_id, worker_compat_hash, score, inferior_ids, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(message.id)
    .bind(message.chat_id)
    .bind(message.parent_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.state.as_str())
    .bind(&message.error)
    .bind(params)
    .bind(message.worker_id)
    .bind(&message.worker_compat_hash)
    .bind(message.score)
    .bind(serde_json::to_value(&message.inferior_ids)?)
    .bind(message.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_message(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    message_id: Uuid,
) -> StoreResult<Message> {
    let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&query)
        .bind(message_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
    message_from_row(&row)
}

async fn touch_chat(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    chat_id: Uuid,
    tail: Option<Uuid>,
) -> StoreResult<()> {
    match tail {
        Some(tail) => {
            sqlx::query(
                "UPDATE chats SET modified_at = $1, active_thread_tail = $2 WHERE id = $3",
            )
            .bind(Utc::now())
            .bind(tail)
            .bind(chat_id)
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query("UPDATE chats SET modified_at = $1 WHERE id = $2")
                .bind(Utc::now())
                .bind(chat_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}
