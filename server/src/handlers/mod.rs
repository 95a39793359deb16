mod auth;
mod chats;
mod events;
mod messages;

pub use auth::{AuthedUser, sign_user_token};
pub use chats::{create_chat, get_chat, list_chats, update_chat};
pub use events::message_events;
pub use messages::{
    cancel_message, create_assistant_message, create_prompter_message, get_message,
    report_message, vote_message,
};
