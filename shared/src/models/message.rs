use super::params::WorkParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Prompter,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::Prompter => "prompter",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompter" => Some(MessageRole::Prompter),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// Lifecycle of a message. Prompter messages are born `Manual` and stay
/// there; assistant messages walk `Pending -> InProgress -> terminal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Manual,
    Pending,
    InProgress,
    Complete,
    AbortedByWorker,
    Cancelled,
    Timeout,
    PendingSafetyReview,
}

impl MessageState {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Manual => "manual",
            MessageState::Pending => "pending",
            MessageState::InProgress => "in_progress",
            MessageState::Complete => "complete",
            MessageState::AbortedByWorker => "aborted_by_worker",
            MessageState::Cancelled => "cancelled",
            MessageState::Timeout => "timeout",
            MessageState::PendingSafetyReview => "pending_safety_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(MessageState::Manual),
            "pending" => Some(MessageState::Pending),
            "in_progress" => Some(MessageState::InProgress),
            "complete" => Some(MessageState::Complete),
            "aborted_by_worker" => Some(MessageState::AbortedByWorker),
            "cancelled" => Some(MessageState::Cancelled),
            "timeout" => Some(MessageState::Timeout),
            "pending_safety_review" => Some(MessageState::PendingSafetyReview),
            _ => None,
        }
    }

    /// Terminal states freeze content; no further transitions exist.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Manual
                | MessageState::Complete
                | MessageState::AbortedByWorker
                | MessageState::Cancelled
                | MessageState::Timeout
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            MessageState::AbortedByWorker | MessageState::Cancelled | MessageState::Timeout
        )
    }

    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (Pending, InProgress)
            | (Pending, Timeout)
            | (Pending, Cancelled)
            | (Pending, AbortedByWorker)
            | (Pending, PendingSafetyReview)
            | (InProgress, Complete)
            | (InProgress, AbortedByWorker)
            | (InProgress, Timeout)
            | (InProgress, Cancelled)
            | (InProgress, PendingSafetyReview)
            // A stalled worker releases the message for another attempt.
            | (InProgress, Pending)
            | (PendingSafetyReview, Pending)
            | (PendingSafetyReview, AbortedByWorker) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    /// None only for the root prompter message of a chat.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub state: MessageState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub work_parameters: Option<WorkParameters>,
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    #[serde(default)]
    pub worker_compat_hash: Option<String>,
    #[serde(default)]
    pub score: i32,
    /// Assistant-only: inferior drafts this message outranks.
    #[serde(default)]
    pub inferior_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new_prompter(chat_id: Uuid, parent_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            chat_id,
            parent_id,
            role: MessageRole::Prompter,
            content: content.into(),
            state: MessageState::Manual,
            error: None,
            work_parameters: None,
            worker_id: None,
            worker_compat_hash: None,
            score: 0,
            inferior_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn new_assistant(chat_id: Uuid, parent_id: Uuid, work_parameters: WorkParameters) -> Self {
        let compat_hash = work_parameters.compat_hash();
        Self {
            id: Uuid::now_v7(),
            chat_id,
            parent_id: Some(parent_id),
            role: MessageRole::Assistant,
            content: String::new(),
            state: MessageState::Pending,
            error: None,
            work_parameters: Some(work_parameters),
            worker_id: None,
            worker_compat_hash: Some(compat_hash),
            score: 0,
            inferior_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

// Request payloads

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreatePrompterMessageRequest {
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateAssistantMessageRequest {
    pub parent_id: Uuid,
    pub model_config_name: String,
    #[serde(default)]
    pub sampling_parameters: Option<super::params::SamplingParameters>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_profile: Option<String>,
    #[serde(default)]
    pub plugins: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VoteRequest {
    pub score: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReportRequest {
    pub report_type: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transition() {
        use MessageState::*;
        for terminal in [Manual, Complete, AbortedByWorker, Cancelled, Timeout] {
            assert!(terminal.is_terminal());
            for next in [
                Manual,
                Pending,
                InProgress,
                Complete,
                AbortedByWorker,
                Cancelled,
                Timeout,
                PendingSafetyReview,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} should be rejected"
                );
            }
        }
    }

    #[test]
    fn pending_transitions() {
        use MessageState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Timeout));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(PendingSafetyReview));
        assert!(!Pending.can_transition_to(Complete));
    }

    #[test]
    fn safety_review_resolves_to_retry_or_abort() {
        use MessageState::*;
        assert!(!PendingSafetyReview.is_terminal());
        assert!(PendingSafetyReview.can_transition_to(Pending));
        assert!(PendingSafetyReview.can_transition_to(AbortedByWorker));
        assert!(!PendingSafetyReview.can_transition_to(Complete));
    }

    #[test]
    fn new_assistant_starts_pending_with_hash() {
        let params = WorkParameters::for_model("m1");
        let msg = Message::new_assistant(Uuid::now_v7(), Uuid::now_v7(), params.clone());
        assert_eq!(msg.state, MessageState::Pending);
        assert!(msg.content.is_empty());
        assert_eq!(msg.worker_compat_hash.as_deref(), Some(params.compat_hash().as_str()));
    }
}
