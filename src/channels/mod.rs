//! Messaging gateway abstraction.

pub mod channel;
pub mod telegram;

pub use channel::*;
pub use telegram::TelegramChannel;
