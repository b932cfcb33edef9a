//! # nudge-channels
//!
//! Messaging platform integrations for Nudge.

pub mod telegram;
pub mod utils;

pub use telegram::TelegramChannel;
