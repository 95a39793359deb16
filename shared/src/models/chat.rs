use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub allow_data_use: bool,
    /// The leaf message the client is currently viewing.
    #[serde(default)]
    pub active_thread_tail_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            title: None,
            hidden: false,
            allow_data_use: true,
            active_thread_tail_message_id: None,
            created_at: now,
            modified_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UpdateChatRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub allow_data_use: Option<bool>,
    #[serde(default)]
    pub active_thread_tail_message_id: Option<Uuid>,
}

/// Keyset cursor over `(modified_at, id)` descending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChatCursor {
    pub modified_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ChatCursor {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.modified_at.timestamp_micros(), self.id)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (micros, id) = s.split_once(':')?;
        let micros: i64 = micros.parse().ok()?;
        Some(Self {
            modified_at: DateTime::from_timestamp_micros(micros)?,
            id: id.parse().ok()?,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatPage {
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = ChatCursor {
            modified_at: DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap(),
            id: Uuid::now_v7(),
        };
        assert_eq!(ChatCursor::decode(&cursor.encode()), Some(cursor));
        assert_eq!(ChatCursor::decode("garbage"), None);
    }
}
