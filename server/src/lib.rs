pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod store;
pub mod worker;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::queue::Broker;
use crate::store::ChatStore;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub broker: Arc<dyn Broker>,
    pub config: Arc<Config>,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    /// Wires the components together and starts the compliance scheduler.
    pub fn new(store: Arc<dyn ChatStore>, broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        let coordinator = Coordinator::new(store.clone(), broker.clone(), config.clone());
        coordinator.clone().spawn_compliance_scheduler();
        Self {
            store,
            broker,
            config,
            coordinator,
        }
    }
}

pub fn init(router: Router<AppState>, state: AppState) -> Router<()> {
    router
        .route("/api/health", get(|| async { "OK" }))
        .route(
            "/chats",
            get(handlers::list_chats).post(handlers::create_chat),
        )
        .route(
            "/chats/{chat_id}",
            get(handlers::get_chat).put(handlers::update_chat),
        )
        .route(
            "/chats/{chat_id}/prompter_message",
            post(handlers::create_prompter_message),
        )
        .route(
            "/chats/{chat_id}/assistant_message",
            post(handlers::create_assistant_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}",
            get(handlers::get_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}/events",
            get(handlers::message_events),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}/cancel",
            post(handlers::cancel_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}/vote",
            post(handlers::vote_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}/report",
            post(handlers::report_message),
        )
        .route("/worker/ws", get(worker::worker_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
