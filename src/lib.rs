//! Revision Bot: weekly structured check-ins over Telegram, stored in
//! Google Sheets and Drive.

pub mod channels;
pub mod config;
pub mod error;
pub mod google;
pub mod review;
pub mod store;
