//! Wire vocabularies: worker WebSocket frames, token-queue packets, and the
//! client-facing SSE events. All are tagged unions discriminated on a
//! `type` / `kind` / `event_type` field.

use crate::models::{Message, MessageRole, WorkParameters, WorkerConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One turn of generation context, root to leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub content: String,
}

/// First frame a worker must send after the socket opens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerIdentify {
    pub api_key: String,
    pub config: WorkerConfig,
}

/// Server -> worker frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Work {
        message_id: Uuid,
        thread: Vec<ThreadMessage>,
        parameters: WorkParameters,
        /// Echo of the config the worker advertised at connect.
        worker_config: WorkerConfig,
    },
    Cancel {
        message_id: Uuid,
    },
    Compliance {
        prompt: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Success,
    Cancelled,
    StopSequence,
    Error,
}

/// Worker -> server frames, after `WorkerIdentify`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerPacket {
    Token {
        text: String,
        #[serde(default)]
        log_prob: Option<f32>,
        #[serde(default)]
        token_id: Option<u32>,
    },
    Heartbeat,
    SafePrompt {
        safe_prompt: String,
    },
    PluginIntermediate {
        data: serde_json::Value,
    },
    Error {
        error: String,
        recoverable: bool,
    },
    End {
        reason: EndReason,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Token-queue entries, serialized between the worker session (producer)
/// and the SSE stream (consumer). `End` is terminal for a queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePacket {
    Token {
        text: String,
        #[serde(default)]
        log_prob: Option<f32>,
        #[serde(default)]
        token_id: Option<u32>,
    },
    SafePrompt {
        safe_prompt: String,
        /// Fresh attempt created by the coordinator, if any.
        #[serde(default)]
        retry_message_id: Option<Uuid>,
    },
    PluginIntermediate {
        data: serde_json::Value,
    },
    Error {
        error: String,
        recoverable: bool,
    },
    End {
        reason: EndReason,
        #[serde(default)]
        error: Option<String>,
    },
}

impl ResponsePacket {
    pub fn is_end(&self) -> bool {
        matches!(self, ResponsePacket::End { .. })
    }
}

/// Events of the client-facing SSE stream. A stream closes with exactly one
/// terminal event: `message` on success, `error` otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum StreamEvent {
    Pending {
        queue_position: usize,
        queue_size: usize,
    },
    Token {
        text: String,
    },
    SafePrompt {
        safe_prompt: String,
        message: Message,
    },
    PluginIntermediate {
        data: serde_json::Value,
    },
    Error {
        error: String,
        #[serde(default)]
        message: Option<Message>,
    },
    Message {
        message: Message,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Pending { .. } => "pending",
            StreamEvent::Token { .. } => "token",
            StreamEvent::SafePrompt { .. } => "safe_prompt",
            StreamEvent::PluginIntermediate { .. } => "plugin_intermediate",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Message { .. } => "message",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Message { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_packets_use_snake_case_tags() {
        let packet = WorkerPacket::End {
            reason: EndReason::StopSequence,
            error: None,
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["type"], "end");
        assert_eq!(json["reason"], "stop_sequence");
    }

    #[test]
    fn response_packet_decodes_from_tagged_json() {
        let packet: ResponsePacket =
            serde_json::from_str(r#"{"kind":"token","text":"Hi","log_prob":-0.5}"#).unwrap();
        assert_eq!(
            packet,
            ResponsePacket::Token {
                text: "Hi".into(),
                log_prob: Some(-0.5),
                token_id: None,
            }
        );
        assert!(!packet.is_end());
    }

    #[test]
    fn stream_event_names_match_envelope() {
        let ev = StreamEvent::Pending {
            queue_position: 0,
            queue_size: 1,
        };
        assert_eq!(ev.event_type(), "pending");
        assert!(!ev.is_terminal());
        let ev = StreamEvent::Error {
            error: "timeout".into(),
            message: None,
        };
        assert!(ev.is_terminal());
    }
}
