//! Worker-facing WebSocket sessions. A session authenticates with its api
//! key, advertises a `WorkerConfig`, then alternates between idling on its
//! work queue and streaming one assistant message at a time.

use crate::AppState;
use crate::error::ApiError;
use crate::queue::ComplianceQueue;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use shared::models::{Message, MessageRole, MessageState, Worker, WorkerConfig};
use shared::protocol::{
    EndReason, ResponsePacket, ThreadMessage, WorkerIdentify, WorkerPacket, WorkerRequest,
};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("socket closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("compat hash {0} not allowed")]
    HashNotAllowed(String),
    #[error("worker missed its heartbeat window")]
    HeartbeatTimeout,
    #[error("worker stalled mid-stream")]
    Stall,
    #[error("worker did not acknowledge cancel in time")]
    CancelAckTimeout,
    #[error(transparent)]
    Api(#[from] ApiError),
}

type Sink = SplitSink<WebSocket, WsMessage>;
type Source = SplitStream<WebSocket>;

pub async fn worker_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        match run_session(state, socket).await {
            Ok(()) | Err(SessionError::Closed) => {}
            Err(e) => tracing::warn!("worker session ended: {e}"),
        }
    })
}

async fn run_session(state: AppState, socket: WebSocket) -> Result<(), SessionError> {
    let (mut sink, mut source) = socket.split();

    // The first frame must identify the worker.
    let identify = tokio::time::timeout(
        state.config.heartbeat_interval * 2,
        recv_text(&mut source),
    )
    .await
    .map_err(|_| SessionError::Protocol("no identify frame".into()))??;
    let identify: WorkerIdentify = serde_json::from_str(&identify)
        .map_err(|e| SessionError::Protocol(format!("bad identify frame: {e}")))?;

    let worker = state
        .store
        .find_worker_by_api_key(&identify.api_key)
        .await
        .map_err(ApiError::from)?
        .ok_or(SessionError::Unauthorized)?;
    let compat_hash = identify.config.compat_hash();
    if !state.config.allowed_compat_hashes.allows(&compat_hash) {
        let _ = sink.send(WsMessage::Close(None)).await;
        return Err(SessionError::HashNotAllowed(compat_hash));
    }
    tracing::info!(
        "worker {} ({}) connected for model {} (hash {compat_hash})",
        worker.id,
        worker.name,
        identify.config.model_config_name
    );

    let result = serve_worker(&state, &worker, &identify.config, &compat_hash, &mut sink, &mut source).await;
    if let Err(e) = &result {
        tracing::debug!("worker {} session error: {e}", worker.id);
    }
    result
}

async fn serve_worker(
    state: &AppState,
    worker: &Worker,
    worker_config: &WorkerConfig,
    compat_hash: &str,
    sink: &mut Sink,
    source: &mut Source,
) -> Result<(), SessionError> {
    let work_queue = state.coordinator.work_queue(compat_hash);
    let compliance_queue = ComplianceQueue::new(state.broker.clone(), worker.id);
    // The two-heartbeat budget applies while idle too, or a dead socket
    // would keep popping work into the void.
    let heartbeat_window = state.config.heartbeat_interval * 2;
    let mut heartbeat_deadline = Instant::now() + heartbeat_window;
    loop {
        // Compliance canaries preempt regular work.
        if let Some(prompt) = compliance_queue.try_pop().await.map_err(ApiError::from)? {
            run_compliance(state, worker, compat_hash, prompt, sink, source).await?;
            heartbeat_deadline = Instant::now() + heartbeat_window;
            continue;
        }
        tokio::select! {
            popped = work_queue.pop(state.config.heartbeat_interval) => {
                if let Some(message_id) = popped.map_err(ApiError::from)? {
                    stream_one(state, worker, worker_config, message_id, sink, source).await?;
                    heartbeat_deadline = Instant::now() + heartbeat_window;
                }
            }
            frame = source.next() => {
                match idle_frame(frame)? {
                    IdleFrame::Heartbeat => heartbeat_deadline = Instant::now() + heartbeat_window,
                    IdleFrame::Closed => return Err(SessionError::Closed),
                }
            }
            _ = tokio::time::sleep_until(heartbeat_deadline) => {
                return Err(SessionError::HeartbeatTimeout);
            }
        }
    }
}

enum IdleFrame {
    Heartbeat,
    Closed,
}

fn idle_frame(
    frame: Option<Result<WsMessage, axum::Error>>,
) -> Result<IdleFrame, SessionError> {
    match frame {
        None | Some(Ok(WsMessage::Close(_))) => Ok(IdleFrame::Closed),
        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str(&text) {
            Ok(WorkerPacket::Heartbeat) => Ok(IdleFrame::Heartbeat),
            Ok(other) => Err(SessionError::Protocol(format!(
                "unexpected idle packet {other:?}"
            ))),
            Err(e) => Err(SessionError::Protocol(format!("bad frame: {e}"))),
        },
        Some(Ok(_)) => Ok(IdleFrame::Heartbeat),
        Some(Err(e)) => Err(e.into()),
    }
}

async fn recv_text(source: &mut Source) -> Result<String, SessionError> {
    loop {
        match source.next().await {
            None | Some(Ok(WsMessage::Close(_))) => return Err(SessionError::Closed),
            Some(Ok(WsMessage::Text(text))) => return Ok(text.to_string()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_request(sink: &mut Sink, request: &WorkerRequest) -> Result<(), SessionError> {
    let encoded = serde_json::to_string(request)
        .map_err(|e| SessionError::Protocol(format!("unencodable request: {e}")))?;
    sink.send(WsMessage::Text(encoded.into())).await?;
    Ok(())
}

/// Streams one assistant message end to end. On worker failure the message
/// is handed back to the coordinator before the error propagates.
async fn stream_one(
    state: &AppState,
    worker: &Worker,
    worker_config: &WorkerConfig,
    message_id: Uuid,
    sink: &mut Sink,
    source: &mut Source,
) -> Result<(), SessionError> {
    let message = state
        .store
        .get_message(message_id)
        .await
        .map_err(ApiError::from)?;
    // Queue entries can outlive their message's pending state (cancel or
    // timeout races); stale entries are skipped, not errors.
    if message.state != MessageState::Pending {
        tracing::debug!(
            "skipping popped message {message_id} in state {}",
            message.state.as_str()
        );
        return Ok(());
    }
    let parameters = message
        .work_parameters
        .clone()
        .ok_or_else(|| SessionError::Protocol(format!("message {message_id} has no parameters")))?;
    let thread = state
        .store
        .get_thread(message_id)
        .await
        .map_err(ApiError::from)?;
    let thread = wire_thread(&thread, parameters.safe_prompt_replacement.as_deref());

    let queue = state.coordinator.token_queue(message_id);
    let mut cancel_rx = state.coordinator.subscribe_cancel(message_id).await;
    if *cancel_rx.borrow() {
        // Cancelled between queue pop and pickup.
        state
            .coordinator
            .finish_stream(&queue, message_id, EndReason::Cancelled, Some("cancelled"))
            .await?;
        return Ok(());
    }

    send_request(
        sink,
        &WorkerRequest::Work {
            message_id,
            thread,
            parameters,
            worker_config: worker_config.clone(),
        },
    )
    .await?;

    let heartbeat_window = state.config.heartbeat_interval * 2;
    let mut heartbeat_deadline = Instant::now() + heartbeat_window;
    let mut stall_deadline = Instant::now() + state.config.timeout_stall;
    let mut cancel_deadline = Instant::now();
    let mut cancel_sent = false;
    let mut decode_failures = 0u32;

    // The streaming loop runs inside its own block so that every error
    // exit, including store and broker failures from the relay calls,
    // funnels into `outcome` and through the failure handler below. A
    // message must never be left `in_progress` with no owner.
    let outcome: Result<(), SessionError> = async {
        loop {
            tokio::select! {
                frame = source.next() => {
                    let text = match frame {
                        None | Some(Ok(WsMessage::Close(_))) => break Err(SessionError::Closed),
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(e.into()),
                    };
                    let packet: WorkerPacket = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        // A lone garbled frame is recoverable; a run of them
                        // is not.
                        Err(e) if decode_failures < 3 => {
                            decode_failures += 1;
                            tracing::warn!("undecodable frame from worker {} ({e})", worker.id);
                            continue;
                        }
                        Err(e) => break Err(SessionError::Protocol(format!("bad frame: {e}"))),
                    };
                    decode_failures = 0;
                    heartbeat_deadline = Instant::now() + heartbeat_window;
                    match packet {
                        WorkerPacket::Heartbeat => {}
                        WorkerPacket::Token { text, log_prob, token_id } => {
                            state
                                .coordinator
                                .relay_token(&queue, message_id, worker.id, &text, log_prob, token_id)
                                .await?;
                            stall_deadline = Instant::now() + state.config.timeout_stall;
                        }
                        WorkerPacket::PluginIntermediate { data } => {
                            queue
                                .push(&ResponsePacket::PluginIntermediate { data })
                                .await
                                .map_err(ApiError::from)?;
                            stall_deadline = Instant::now() + state.config.timeout_stall;
                        }
                        WorkerPacket::SafePrompt { safe_prompt } => {
                            state
                                .coordinator
                                .resolve_safe_prompt(&queue, message_id, &safe_prompt)
                                .await?;
                            stall_deadline = Instant::now() + state.config.timeout_stall;
                        }
                        WorkerPacket::Error { error, recoverable } => {
                            tracing::warn!(
                                "worker {} error on {message_id} (recoverable={recoverable}): {error}",
                                worker.id
                            );
                            queue
                                .push(&ResponsePacket::Error { error, recoverable })
                                .await
                                .map_err(ApiError::from)?;
                        }
                        WorkerPacket::End { reason, error } => {
                            state
                                .coordinator
                                .finish_stream(&queue, message_id, reason, error.as_deref())
                                .await?;
                            break Ok(());
                        }
                    }
                }
                changed = cancel_rx.changed(), if !cancel_sent => {
                    if changed.is_err() || !*cancel_rx.borrow_and_update() {
                        continue;
                    }
                    send_request(sink, &WorkerRequest::Cancel { message_id }).await?;
                    cancel_sent = true;
                    cancel_deadline = Instant::now() + state.config.cancel_ack_timeout;
                }
                _ = tokio::time::sleep_until(cancel_deadline), if cancel_sent => {
                    // Worker ignored the cancel; finalize without it and drop
                    // the session to stop the orphaned stream.
                    state
                        .coordinator
                        .finish_stream(&queue, message_id, EndReason::Cancelled, Some("cancelled"))
                        .await?;
                    break Err(SessionError::CancelAckTimeout);
                }
                _ = tokio::time::sleep_until(heartbeat_deadline) => {
                    break Err(SessionError::HeartbeatTimeout);
                }
                _ = tokio::time::sleep_until(stall_deadline) => {
                    break Err(SessionError::Stall);
                }
            }
        }
    }
    .await;

    if let Err(e) = outcome {
        state.coordinator.handle_worker_failure(message_id).await?;
        return Err(e);
    }
    Ok(())
}

/// Root-to-leaf generation context. The pending assistant leaf is dropped;
/// a safety replacement substitutes the final prompter turn.
fn wire_thread(thread: &[Message], safe_replacement: Option<&str>) -> Vec<ThreadMessage> {
    let mut wire: Vec<ThreadMessage> = thread
        .iter()
        .filter(|m| !(m.role == MessageRole::Assistant && m.content.is_empty()))
        .map(|m| ThreadMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    if let Some(replacement) = safe_replacement
        && let Some(last_prompter) = wire
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Prompter)
    {
        last_prompter.content = replacement.to_string();
    }
    wire
}

/// Runs one compliance canary: the worker answers the prompt, the token
/// texts are hashed, and the coordinator compares the signature against the
/// reference for this compat hash.
async fn run_compliance(
    state: &AppState,
    worker: &Worker,
    compat_hash: &str,
    prompt: String,
    sink: &mut Sink,
    source: &mut Source,
) -> Result<(), SessionError> {
    send_request(sink, &WorkerRequest::Compliance { prompt }).await?;
    let mut transcript = String::new();
    let deadline = Instant::now() + state.config.timeout_stall;
    loop {
        let frame = tokio::time::timeout_at(deadline, recv_text(source))
            .await
            .map_err(|_| SessionError::Stall)??;
        let packet: WorkerPacket = serde_json::from_str(&frame)
            .map_err(|e| SessionError::Protocol(format!("bad frame: {e}")))?;
        match packet {
            WorkerPacket::Token { text, .. } => transcript.push_str(&text),
            WorkerPacket::Heartbeat => {}
            WorkerPacket::End { .. } => break,
            WorkerPacket::Error { error, .. } => {
                tracing::warn!("worker {} failed its compliance run: {error}", worker.id);
                break;
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected compliance packet {other:?}"
                )));
            }
        }
    }
    let signature = compliance_signature(&transcript);
    let passed = state
        .coordinator
        .complete_compliance(worker, compat_hash, &signature)
        .await?;
    tracing::info!(
        "worker {} compliance run {}",
        worker.id,
        if passed { "passed" } else { "failed" }
    );
    Ok(())
}

fn compliance_signature(transcript: &str) -> String {
    hex::encode(Sha256::digest(transcript.as_bytes()))
}
