//! Cross-component invariants: timeout scheduling, cancellation routing,
//! safe-prompt resolution, and the compliance schedule. The coordinator is
//! the only component that decides when a message changes state; the store
//! merely executes the transitions.

use crate::config::Config;
use crate::error::ApiError;
use crate::queue::{Broker, ComplianceQueue, TokenQueue, WorkQueue};
use crate::store::{ChatStore, StoreError};
use chrono::Utc;
use shared::models::{Message, MessageState, Worker};
use shared::protocol::{EndReason, ResponsePacket};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// Prompt pushed onto a worker's compliance queue. The first trusted
/// worker's answer for a compat hash becomes the reference signature.
pub const COMPLIANCE_CANARY_PROMPT: &str =
    "Repeat the following exactly, with no preamble: the quick brown fox jumps over the lazy dog";

pub struct Coordinator {
    store: Arc<dyn ChatStore>,
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    /// Cancel signal per in-flight assistant message. The sender side flips
    /// to `true`; worker sessions subscribe while streaming.
    cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    /// Reference compliance signatures per compat hash.
    compliance_refs: Mutex<HashMap<String, String>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        broker: Arc<dyn Broker>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            config,
            cancels: Mutex::new(HashMap::new()),
            compliance_refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn token_queue(&self, message_id: Uuid) -> TokenQueue {
        TokenQueue::new(self.broker.clone(), message_id)
    }

    pub fn work_queue(&self, compat_hash: &str) -> WorkQueue {
        WorkQueue::new(self.broker.clone(), compat_hash)
    }

    /// Puts a freshly initiated assistant message on its work queue and arms
    /// the `pending -> timeout` timer.
    pub async fn enqueue_assistant(self: &Arc<Self>, message: &Message) -> Result<(), ApiError> {
        let compat_hash = message
            .worker_compat_hash
            .clone()
            .ok_or_else(|| ApiError::InvalidRequest("message has no compat hash".into()))?;
        self.work_queue(&compat_hash).enqueue(message.id).await?;
        self.spawn_schedule_timeout(message.id, compat_hash);
        Ok(())
    }

    fn spawn_schedule_timeout(self: &Arc<Self>, message_id: Uuid, compat_hash: String) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.config.timeout_schedule).await;
            if let Err(e) = coordinator.expire_if_pending(message_id, &compat_hash).await {
                tracing::error!("schedule-timeout sweep for {message_id} failed: {e}");
            }
        });
    }

    async fn expire_if_pending(&self, message_id: Uuid, compat_hash: &str) -> Result<(), ApiError> {
        let message = self.store.get_message(message_id).await?;
        if message.state != MessageState::Pending {
            return Ok(());
        }
        self.work_queue(compat_hash).remove(message_id).await?;
        // Re-check after removal: a worker may have popped it meanwhile.
        match self
            .store
            .finalize_message(message_id, MessageState::Timeout, Some("timeout"))
            .await
        {
            Ok(_) => {
                tracing::info!("message {message_id} timed out waiting for a worker");
                self.push_end(message_id, EndReason::Error, Some("timeout"))
                    .await?;
                self.drop_cancel(message_id).await;
                Ok(())
            }
            Err(StoreError::InvalidTransition { from, .. })
                if from == MessageState::InProgress =>
            {
                // Popped in the race window; the stall timer owns it now.
                Ok(())
            }
            Err(StoreError::AlreadyFinalized { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribes a worker session to the cancel signal for a message.
    pub async fn subscribe_cancel(&self, message_id: Uuid) -> watch::Receiver<bool> {
        let mut cancels = self.cancels.lock().await;
        cancels
            .entry(message_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub async fn drop_cancel(&self, message_id: Uuid) {
        self.cancels.lock().await.remove(&message_id);
    }

    /// Client cancellation entry point. Pre-pop work is removed from the
    /// queue and finalized `cancelled`; in-flight work gets the session
    /// signal and is finalized once the worker acknowledges.
    pub async fn request_cancel(&self, message: &Message) -> Result<(), ApiError> {
        if message.state.is_terminal() {
            // Cancelling a terminal message is a no-op.
            return Ok(());
        }
        if message.state == MessageState::Pending {
            if let Some(hash) = message.worker_compat_hash.as_deref() {
                if self.work_queue(hash).remove(message.id).await? {
                    self.store
                        .finalize_message(message.id, MessageState::Cancelled, Some("cancelled"))
                        .await?;
                    self.push_end(message.id, EndReason::Cancelled, Some("cancelled"))
                        .await?;
                    self.drop_cancel(message.id).await;
                    return Ok(());
                }
            }
        }
        // Already popped (or mid-stream): signal the owning session.
        let mut cancels = self.cancels.lock().await;
        let sender = cancels
            .entry(message.id)
            .or_insert_with(|| watch::channel(false).0);
        let _ = sender.send(true);
        Ok(())
    }

    /// Applies one token from the owning worker session: append to the
    /// store (entering `in_progress` on the first call) and relay to the
    /// message's token queue.
    pub async fn relay_token(
        &self,
        queue: &TokenQueue,
        message_id: Uuid,
        worker_id: Uuid,
        text: &str,
        log_prob: Option<f32>,
        token_id: Option<u32>,
    ) -> Result<Message, ApiError> {
        let message = self.store.append_content(message_id, worker_id, text).await?;
        queue
            .push(&ResponsePacket::Token {
                text: text.to_string(),
                log_prob,
                token_id,
            })
            .await?;
        Ok(message)
    }

    /// Terminal transition driven by a worker `End` packet.
    pub async fn finish_stream(
        &self,
        queue: &TokenQueue,
        message_id: Uuid,
        reason: EndReason,
        error: Option<&str>,
    ) -> Result<(), ApiError> {
        let state = match reason {
            EndReason::Success | EndReason::StopSequence => MessageState::Complete,
            EndReason::Cancelled => MessageState::Cancelled,
            EndReason::Error => MessageState::AbortedByWorker,
        };
        let error = match state {
            MessageState::AbortedByWorker => Some(error.unwrap_or("worker_fatal")),
            MessageState::Cancelled => Some("cancelled"),
            _ => None,
        };
        match self.store.finalize_message(message_id, state, error).await {
            Ok(_) => {}
            // The schedule/stall timer or a racing cancel got there first;
            // the message keeps its earlier terminal state.
            Err(StoreError::AlreadyFinalized { state, .. }) => {
                tracing::debug!(
                    "message {message_id} already finalized as {} before end packet",
                    state.as_str()
                );
            }
            Err(StoreError::InvalidTransition { to, .. }) if to == MessageState::Complete => {
                // A worker "succeeded" without ever sending content, either
                // straight from pending or after a zero-length first token.
                self.store
                    .finalize_message(
                        message_id,
                        MessageState::AbortedByWorker,
                        Some("worker_fatal"),
                    )
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        queue
            .push(&ResponsePacket::End {
                reason,
                error: error.map(String::from),
            })
            .await?;
        queue.expire(self.config.token_queue_ttl).await?;
        self.drop_cancel(message_id).await;
        Ok(())
    }

    /// A worker session died (missed heartbeats, stall, disconnect) while
    /// owning this message. Content-less work is released for another
    /// worker; partial output finalizes as `timeout` and is not re-queued.
    pub async fn handle_worker_failure(self: &Arc<Self>, message_id: Uuid) -> Result<(), ApiError> {
        let message = self.store.get_message(message_id).await?;
        if message.state.is_terminal() {
            return Ok(());
        }
        if message.content.is_empty() && message.state != MessageState::PendingSafetyReview {
            let released = self.store.release_message(message_id).await?;
            if let Some(hash) = released.worker_compat_hash.as_deref() {
                self.work_queue(hash).enqueue(message_id).await?;
                self.spawn_schedule_timeout(message_id, hash.to_string());
            }
            tracing::info!("released message {message_id} back to pending");
            return Ok(());
        }
        self.store
            .finalize_message(message_id, MessageState::Timeout, Some("timeout"))
            .await?;
        let queue = self.token_queue(message_id);
        queue
            .push(&ResponsePacket::End {
                reason: EndReason::Error,
                error: Some("timeout".into()),
            })
            .await?;
        queue.expire(self.config.token_queue_ttl).await?;
        self.drop_cancel(message_id).await;
        Ok(())
    }

    /// The safety classifier rewrote the prompt. The original message is
    /// finalized `aborted_by_worker` with reason `safety_rewrite` and a
    /// fresh attempt carrying the rewritten prompt is enqueued. Returns the
    /// retry message.
    pub async fn resolve_safe_prompt(
        self: &Arc<Self>,
        queue: &TokenQueue,
        message_id: Uuid,
        safe_prompt: &str,
    ) -> Result<Message, ApiError> {
        let original = self.store.mark_safety_review(message_id).await?;
        self.store
            .finalize_message(message_id, MessageState::AbortedByWorker, Some("safety_rewrite"))
            .await?;

        let parent_id = original
            .parent_id
            .ok_or_else(|| ApiError::InvalidRequest("assistant message without parent".into()))?;
        let mut parameters = original
            .work_parameters
            .clone()
            .ok_or_else(|| ApiError::InvalidRequest("assistant message without parameters".into()))?;
        parameters.safe_prompt_replacement = Some(safe_prompt.to_string());

        let retry = self
            .store
            .initiate_assistant_message(parent_id, parameters)
            .await?;
        self.enqueue_assistant(&retry).await?;

        queue
            .push(&ResponsePacket::SafePrompt {
                safe_prompt: safe_prompt.to_string(),
                retry_message_id: Some(retry.id),
            })
            .await?;
        tracing::info!(
            "message {message_id} rewritten for safety; retrying as {}",
            retry.id
        );
        Ok(retry)
    }

    async fn push_end(
        &self,
        message_id: Uuid,
        reason: EndReason,
        error: Option<&str>,
    ) -> Result<(), ApiError> {
        let queue = self.token_queue(message_id);
        queue
            .push(&ResponsePacket::End {
                reason,
                error: error.map(String::from),
            })
            .await?;
        queue.expire(self.config.token_queue_ttl).await?;
        Ok(())
    }

    // Compliance

    pub fn spawn_compliance_scheduler(self: Arc<Self>) {
        let tick = self
            .config
            .compliance_interval
            .min(std::time::Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_compliance_sweep().await {
                    tracing::error!("compliance sweep failed: {e}");
                }
            }
        });
    }

    async fn run_compliance_sweep(&self) -> Result<(), ApiError> {
        let due = self.store.workers_due_compliance(Utc::now()).await?;
        for worker in due {
            tracing::info!("scheduling compliance check for worker {}", worker.id);
            self.store
                .set_worker_compliance(worker.id, true, worker.next_compliance_check)
                .await?;
            ComplianceQueue::new(self.broker.clone(), worker.id)
                .enqueue(COMPLIANCE_CANARY_PROMPT.to_string())
                .await?;
        }
        Ok(())
    }

    /// Evaluates a finished compliance run. The first trusted worker's
    /// signature for a hash becomes the reference; any later mismatch
    /// demotes the worker.
    pub async fn complete_compliance(
        &self,
        worker: &Worker,
        compat_hash: &str,
        signature: &str,
    ) -> Result<bool, ApiError> {
        let passed = {
            let mut refs = self.compliance_refs.lock().await;
            match refs.get(compat_hash) {
                Some(expected) => expected == signature,
                None if worker.trusted => {
                    refs.insert(compat_hash.to_string(), signature.to_string());
                    true
                }
                None => true,
            }
        };
        if !passed {
            tracing::warn!(
                "worker {} failed compliance for hash {compat_hash}; demoting",
                worker.id
            );
            self.store.set_worker_trusted(worker.id, false).await?;
        }
        self.store
            .set_worker_compliance(
                worker.id,
                false,
                Some(Utc::now() + chrono::Duration::from_std(self.config.compliance_interval).unwrap_or_else(|_| chrono::Duration::hours(1))),
            )
            .await?;
        Ok(passed)
    }
}
