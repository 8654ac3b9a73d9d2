//! Durable state: scheduler bookkeeping and the chat directory.

pub mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::StateStore;
