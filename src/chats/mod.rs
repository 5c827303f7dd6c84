// src/chats/mod.rs

pub mod manager;

pub use manager::{ChatError, ChatManager, extract_chat_id};
