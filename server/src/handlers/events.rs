use super::AuthedUser;
use super::messages::owned_assistant_message;
use crate::AppState;
use crate::config::SafetyRetryMode;
use crate::error::ApiError;
use crate::queue::{TokenQueue, WorkQueue};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use shared::models::{Message, MessageState};
use shared::protocol::{ResponsePacket, StreamEvent};
use std::convert::Infallible;
use uuid::Uuid;

fn sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(ev) => ev,
        Err(e) => {
            tracing::error!("failed to serialize stream event: {e}");
            Event::default()
                .event("error")
                .data(r#"{"error":"internal"}"#)
        }
    }
}

fn terminal_event(message: Message) -> Event {
    if message.state == MessageState::Complete {
        sse_event(&StreamEvent::Message { message })
    } else {
        let error = message
            .error
            .clone()
            .unwrap_or_else(|| message.state.as_str().to_string());
        sse_event(&StreamEvent::Error {
            error,
            message: Some(message),
        })
    }
}

/// SSE stream for one assistant message. Replays state already in the
/// store, then follows the live token queue; closes after exactly one
/// terminal event.
pub async fn message_events(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    owned_assistant_message(&state, &user_id, chat_id, message_id).await?;
    let stream = event_stream(state, message_id);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_stream(
    state: AppState,
    message_id: Uuid,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let poll = state.config.timeout_stall;
        let mut current = message_id;
        'attempt: loop {
            let message = match state.store.get_message(current).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!("event stream lost message {current}: {e}");
                    yield Ok(sse_event(&StreamEvent::Error {
                        error: "storage_unavailable".into(),
                        message: None,
                    }));
                    break;
                }
            };
            if message.state.is_terminal() {
                yield Ok(terminal_event(message));
                break;
            }

            if message.state == MessageState::Pending {
                if let Some(hash) = message.worker_compat_hash.as_deref() {
                    let position = WorkQueue::new(state.broker.clone(), hash)
                        .position(current)
                        .await;
                    if let Ok(Some((queue_position, queue_size))) = position {
                        yield Ok(sse_event(&StreamEvent::Pending { queue_position, queue_size }));
                    }
                }
            }
            // Tokens that streamed before this subscriber attached.
            if !message.content.is_empty() {
                yield Ok(sse_event(&StreamEvent::Token { text: message.content.clone() }));
            }

            let queue = TokenQueue::new(state.broker.clone(), current);
            let mut follow: Option<Uuid> = None;
            loop {
                match queue.pop(poll).await {
                    Ok(Some(ResponsePacket::Token { text, .. })) => {
                        yield Ok(sse_event(&StreamEvent::Token { text }));
                    }
                    Ok(Some(ResponsePacket::PluginIntermediate { data })) => {
                        yield Ok(sse_event(&StreamEvent::PluginIntermediate { data }));
                    }
                    Ok(Some(ResponsePacket::SafePrompt { safe_prompt, retry_message_id })) => {
                        let Some(retry_id) = retry_message_id else { continue };
                        match state.store.get_message(retry_id).await {
                            Ok(retry) => {
                                yield Ok(sse_event(&StreamEvent::SafePrompt {
                                    safe_prompt,
                                    message: retry,
                                }));
                            }
                            Err(e) => {
                                tracing::error!("safe-prompt retry {retry_id} missing: {e}");
                            }
                        }
                        // Seamless mode carries on with the retry's tokens
                        // after the original's end packet; surface mode
                        // leaves re-subscribing to the client.
                        if state.config.safety_retry == SafetyRetryMode::Seamless {
                            follow = Some(retry_id);
                        }
                    }
                    Ok(Some(ResponsePacket::Error { error, recoverable })) => {
                        // The terminal outcome arrives with the end packet.
                        tracing::debug!("worker error on {current} (recoverable={recoverable}): {error}");
                    }
                    Ok(Some(ResponsePacket::End { .. })) => {
                        if let Some(next) = follow.take() {
                            current = next;
                            continue 'attempt;
                        }
                        match state.store.get_message(current).await {
                            Ok(final_message) => yield Ok(terminal_event(final_message)),
                            Err(e) => {
                                tracing::error!("event stream lost message {current}: {e}");
                                yield Ok(sse_event(&StreamEvent::Error {
                                    error: "storage_unavailable".into(),
                                    message: None,
                                }));
                            }
                        }
                        break 'attempt;
                    }
                    Ok(None) => {
                        // Queue idle past the stall window; the state machine
                        // may have finalized without us seeing the end packet
                        // (queue expired before we attached).
                        match state.store.get_message(current).await {
                            Ok(m) if m.state.is_terminal() => {
                                yield Ok(terminal_event(m));
                                break 'attempt;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!("event stream lost message {current}: {e}");
                                yield Ok(sse_event(&StreamEvent::Error {
                                    error: "storage_unavailable".into(),
                                    message: None,
                                }));
                                break 'attempt;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("token queue error on {current}: {e}");
                        yield Ok(sse_event(&StreamEvent::Error {
                            error: "queue_unavailable".into(),
                            message: None,
                        }));
                        break 'attempt;
                    }
                }
            }
        }
    }
}
