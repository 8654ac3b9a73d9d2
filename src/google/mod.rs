//! Google Sheets and Drive clients backing the roster, the question
//! catalog, the answer sink, and photo storage.

pub mod auth;
pub mod client;
pub mod drive;
pub mod sheets;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use client::GoogleClient;
pub use drive::DriveClient;
pub use sheets::{SheetAnswerSink, SheetQuestions, SheetRoster, SheetsClient};
