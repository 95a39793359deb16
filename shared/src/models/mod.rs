pub mod chat;
pub mod message;
pub mod params;
pub mod worker;

pub use chat::*;
pub use message::*;
pub use params::*;
pub use worker::*;
